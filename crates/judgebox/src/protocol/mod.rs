//! Execution protocol between the grader and sandbox orchestrators
//!
//! The grader talks to anything implementing [`Evaluator`]: a local
//! [`BoxManager`](crate::manager::BoxManager), a [`ManagerPool`](crate::manager::ManagerPool)
//! or an [`EvalClient`] connected to a remote worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::protocol::client::EvalClient;
pub use crate::protocol::codec::{ClientMessage, ServerMessage};
pub use crate::protocol::server::EvalServer;
use crate::manager::{BoxManager, ManagerLease, ManagerPool};
use crate::types::TestLimits;

mod client;
mod codec;
mod server;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected message: {0}")]
    Unexpected(String),

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub submission_id: u64,
    pub language: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResponse {
    pub submission_id: u64,
    pub success: bool,
    /// Compiler output, verbatim
    pub output: String,
    /// Why compilation could not be attempted or its result not kept
    #[serde(default)]
    pub other: String,
}

impl CompileResponse {
    pub fn internal(submission_id: u64, reason: impl Into<String>) -> Self {
        Self {
            submission_id,
            success: false,
            output: String::new(),
            other: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    /// Per-submission test result id, echoed back in the response
    pub test_id: u64,
    pub submission_id: u64,
    pub language: String,
    /// Test input, written to `<output_stem>.in`
    pub input: String,
    /// Stem of the input/output files; `stdin` selects console mode
    pub output_stem: String,
    pub limits: TestLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResponse {
    pub test_id: u64,
    /// Contents of the program's output file
    pub output: String,
    /// Seconds
    pub time: f64,
    /// Kilobytes
    pub memory: u64,
    pub status: TestStatus,
    /// Diagnostic message; the reason when `status` is `InternalError`
    pub comments: String,
}

impl TestResponse {
    pub fn internal(test_id: u64, reason: impl Into<String>) -> Self {
        Self {
            test_id,
            output: String::new(),
            time: 0.0,
            memory: 0,
            status: TestStatus::InternalError,
            comments: reason.into(),
        }
    }
}

/// How a single test run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Ok,
    Timeout,
    RuntimeError,
    SandboxError,
    /// The program ran cleanly but left no output file
    MissingOutput,
    /// The grader failed; the test result is not a verdict
    InternalError,
}

/// Something that can compile submissions and run their tests
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Compile a submission and cache its artifact. Idempotent.
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse, ProtocolError>;

    /// Open a stream of test runs for one compiled submission
    async fn execute(&self, submission_id: u64) -> Result<Box<dyn ExecuteStream>, ProtocolError>;

    /// Release sandboxes held by this evaluator
    async fn shutdown(&self) {}
}

/// Test runs of one submission, answered in request order
#[async_trait]
pub trait ExecuteStream: Send {
    async fn run(&mut self, request: TestRequest) -> Result<TestResponse, ProtocolError>;

    /// End the stream; the submission's artifact is deleted
    async fn finish(self: Box<Self>) -> Result<(), ProtocolError>;
}

#[async_trait]
impl Evaluator for Arc<BoxManager> {
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse, ProtocolError> {
        Ok(self.compile_submission(request).await)
    }

    async fn execute(&self, submission_id: u64) -> Result<Box<dyn ExecuteStream>, ProtocolError> {
        Ok(Box::new(LocalStream {
            manager: Arc::clone(self),
            submission_id,
        }))
    }

    async fn shutdown(&self) {
        self.cleanup().await;
    }
}

struct LocalStream {
    manager: Arc<BoxManager>,
    submission_id: u64,
}

#[async_trait]
impl ExecuteStream for LocalStream {
    async fn run(&mut self, request: TestRequest) -> Result<TestResponse, ProtocolError> {
        Ok(self.manager.execute_test(request).await)
    }

    async fn finish(self: Box<Self>) -> Result<(), ProtocolError> {
        self.manager.remove_artifact(self.submission_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Evaluator for ManagerPool {
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse, ProtocolError> {
        let lease = self.acquire().await;
        Ok(lease.compile_submission(request).await)
    }

    /// The stream keeps one manager leased until it finishes
    async fn execute(&self, submission_id: u64) -> Result<Box<dyn ExecuteStream>, ProtocolError> {
        Ok(Box::new(PooledStream {
            lease: self.acquire().await,
            submission_id,
        }))
    }

    async fn shutdown(&self) {
        self.cleanup().await;
    }
}

struct PooledStream {
    lease: ManagerLease,
    submission_id: u64,
}

#[async_trait]
impl ExecuteStream for PooledStream {
    async fn run(&mut self, request: TestRequest) -> Result<TestResponse, ProtocolError> {
        Ok(self.lease.execute_test(request).await)
    }

    async fn finish(self: Box<Self>) -> Result<(), ProtocolError> {
        self.lease.remove_artifact(self.submission_id).await?;
        Ok(())
    }
}
