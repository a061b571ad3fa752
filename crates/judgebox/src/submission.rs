//! Submissions, tests and their per-test results

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TestLimits;

/// Lifecycle of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Waiting,
    Working,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid submission status transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SubmissionStatus,
    pub to: SubmissionStatus,
}

impl SubmissionStatus {
    /// Move to `next`, allowing only `Waiting -> Working -> Done`
    pub fn transition(self, next: SubmissionStatus) -> Result<SubmissionStatus, TransitionError> {
        use SubmissionStatus::*;

        match (self, next) {
            (Waiting, Working) | (Working, Done) => Ok(next),
            (Waiting | Working | Done, _) => Err(TransitionError {
                from: self,
                to: next,
            }),
        }
    }
}

/// Problem settings a submission is graded under
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemSettings {
    /// Stem of the input/output file names (`<stem>.in`, `<stem>.out`)
    pub io_stem: String,
    /// Program talks over stdin/stdout instead of files
    #[serde(default)]
    pub console_input: bool,
    #[serde(default)]
    pub limits: TestLimits,
}

impl ProblemSettings {
    /// Console problems always use the `stdin` stem
    pub fn effective_stem(&self) -> &str {
        if self.console_input {
            CONSOLE_STEM
        } else {
            &self.io_stem
        }
    }
}

/// File stem used when a problem reads from the console
pub const CONSOLE_STEM: &str = "stdin";

/// A test of a problem; payloads live in test storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub id: u64,
    pub problem_id: u64,
    /// Score earned when the test passes
    pub weight: i32,
    /// Index shown to contestants
    pub visible_id: u32,
}

/// One submission's result row for one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: u64,
    pub test: Test,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub score: i32,
    #[serde(default)]
    pub message: String,
    /// Seconds
    #[serde(default)]
    pub time: f64,
    /// Kilobytes
    #[serde(default)]
    pub memory: u64,
}

impl TestResult {
    pub fn new(id: u64, test: Test) -> Self {
        Self {
            id,
            test,
            done: false,
            score: 0,
            message: String::new(),
            time: 0.0,
            memory: 0,
        }
    }

    pub fn apply(&mut self, update: &TestResultUpdate) {
        self.done = true;
        self.score = update.score;
        self.message.clone_from(&update.message);
        self.time = update.time;
        self.memory = update.memory;
    }
}

/// Fields written when a test finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultUpdate {
    pub score: i32,
    pub message: String,
    pub time: f64,
    pub memory: u64,
}

/// A submission as the store hands it to the grader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: u64,
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub user_id: u64,
    pub problem_id: u64,
    #[serde(default = "waiting")]
    pub status: SubmissionStatus,
    /// `None` until compiled
    #[serde(default)]
    pub compile_error: Option<bool>,
    #[serde(default)]
    pub compile_message: Option<String>,
    #[serde(default)]
    pub score: i32,
    pub problem: ProblemSettings,
    #[serde(default)]
    pub tests: Vec<TestResult>,
}

fn waiting() -> SubmissionStatus {
    SubmissionStatus::Waiting
}

impl Submission {
    /// Result rows in the order they are graded
    pub fn tests_in_order(&self) -> Vec<&TestResult> {
        let mut tests: Vec<&TestResult> = self.tests.iter().collect();
        tests.sort_by_key(|t| t.id);
        tests
    }
}
