use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::SubmissionStore;
use crate::submission::{SubmissionStatus, TestResultUpdate};

/// A write to the submission store, queued by a dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Status {
        submission_id: u64,
        status: SubmissionStatus,
        score: i32,
    },
    Compile {
        submission_id: u64,
        success: bool,
        output: String,
    },
    TestResult {
        result_id: u64,
        update: TestResultUpdate,
    },
}

impl Update {
    pub async fn apply(self, store: &dyn SubmissionStore) -> anyhow::Result<()> {
        match self {
            Update::Status {
                submission_id,
                status,
                score,
            } => {
                store
                    .update_submission_status(submission_id, status, score)
                    .await
            }
            Update::Compile {
                submission_id,
                success,
                output,
            } => {
                store
                    .update_compile_result(submission_id, success, output)
                    .await
            }
            Update::TestResult { result_id, update } => {
                store.update_test_result(result_id, update).await
            }
        }
    }
}

/// Persist updates until every sender is gone. Failures are logged and dropped.
///
/// Once the `Done` write of a submission has been attempted its id leaves
/// `in_flight`, so a submission whose final write was lost is polled again.
pub(crate) async fn update_loop(
    mut updates: mpsc::Receiver<Update>,
    store: &dyn SubmissionStore,
    in_flight: &Mutex<HashSet<u64>>,
) {
    while let Some(update) = updates.recv().await {
        let description = format!("{update:?}");
        let finished = match update {
            Update::Status {
                submission_id,
                status: SubmissionStatus::Done,
                ..
            } => Some(submission_id),
            _ => None,
        };
        match update.apply(store).await {
            Ok(()) => debug!(update = %description, "update stored"),
            Err(e) => warn!(update = %description, error = format!("{e:#}"), "failed to store update"),
        }
        if let Some(id) = finished {
            in_flight.lock().remove(&id);
        }
    }
    debug!("update queue drained");
}
