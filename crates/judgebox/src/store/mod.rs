//! Boundaries to the submission database and durable test storage

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWrite;

pub use crate::store::disk::DiskStorage;
pub use crate::store::memory::MemoryStore;
use crate::submission::{Submission, SubmissionStatus, TestResultUpdate};

mod disk;
mod memory;

/// Async byte sink for a submission's output on one test
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Where submissions are read from and verdicts written to
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Waiting submissions, each with its problem settings and result rows
    async fn fetch_waiting_submissions(&self) -> Result<Vec<Submission>>;

    async fn update_submission_status(
        &self,
        id: u64,
        status: SubmissionStatus,
        score: i32,
    ) -> Result<()>;

    /// `id` is the per-submission test result id
    async fn update_test_result(&self, id: u64, update: TestResultUpdate) -> Result<()>;

    async fn update_compile_result(&self, id: u64, success: bool, output: String) -> Result<()>;
}

/// Test payloads and submission outputs
#[async_trait]
pub trait TestStorage: Send + Sync {
    async fn test_input(&self, problem_id: u64, test_id: u64) -> Result<Vec<u8>>;

    async fn test_output(&self, problem_id: u64, test_id: u64) -> Result<Vec<u8>>;

    /// Open (truncating) the durable copy of a submission's output on a test
    async fn submission_output(&self, submission_id: u64, test_id: u64) -> Result<OutputSink>;
}
