use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::store::SubmissionStore;
use crate::submission::{Submission, SubmissionStatus, TestResultUpdate};

/// In-memory submission store, used for batch grading and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    submissions: Arc<Mutex<Vec<Submission>>>,
}

impl MemoryStore {
    pub fn new(submissions: Vec<Submission>) -> Self {
        Self {
            submissions: Arc::new(Mutex::new(submissions)),
        }
    }

    pub fn snapshot(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn get(&self, id: u64) -> Option<Submission> {
        self.submissions.lock().iter().find(|s| s.id == id).cloned()
    }

    pub fn all_done(&self) -> bool {
        self.submissions
            .lock()
            .iter()
            .all(|s| s.status == SubmissionStatus::Done)
    }

    fn with_submission<T>(&self, id: u64, f: impl FnOnce(&mut Submission) -> Result<T>) -> Result<T> {
        let mut submissions = self.submissions.lock();
        let submission = submissions
            .iter_mut()
            .find(|s| s.id == id)
            .with_context(|| format!("unknown submission {id}"))?;
        f(submission)
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn fetch_waiting_submissions(&self) -> Result<Vec<Submission>> {
        Ok(self
            .submissions
            .lock()
            .iter()
            .filter(|s| s.status == SubmissionStatus::Waiting)
            .cloned()
            .collect())
    }

    async fn update_submission_status(
        &self,
        id: u64,
        status: SubmissionStatus,
        score: i32,
    ) -> Result<()> {
        self.with_submission(id, |submission| {
            submission.status = match submission.status.transition(status) {
                Ok(next) => next,
                // A lost `Working` write leaves the row behind; `Done` still lands
                Err(_) if status == SubmissionStatus::Done => SubmissionStatus::Done,
                Err(e) => return Err(e.into()),
            };
            submission.score = score;
            Ok(())
        })
    }

    async fn update_test_result(&self, id: u64, update: TestResultUpdate) -> Result<()> {
        let mut submissions = self.submissions.lock();
        let Some(result) = submissions
            .iter_mut()
            .flat_map(|s| s.tests.iter_mut())
            .find(|t| t.id == id)
        else {
            bail!("unknown test result {id}");
        };
        result.apply(&update);
        Ok(())
    }

    async fn update_compile_result(&self, id: u64, success: bool, output: String) -> Result<()> {
        self.with_submission(id, |submission| {
            submission.compile_error = Some(!success);
            submission.compile_message = Some(output);
            Ok(())
        })
    }
}
