//! A sandboxed grading engine for programming-contest submissions.
//!
//! Judgebox compiles and runs untrusted submissions inside IOI Isolate boxes
//! and scores them against stored tests.
//!
//! # Layers
//!
//! - **Sandbox** ([`isolate`]) — one isolate box: init, file staging, runs,
//!   meta-file parsing and cleanup.
//! - **Orchestrator** ([`manager`]) — compiles submissions, caches artifacts
//!   and runs single tests on a box, resetting it after every unit of work.
//! - **Scheduler** ([`grader`]) — polls the submission store, dispatches work
//!   to evaluators and writes verdicts back.
//! - **Protocol** ([`protocol`]) — the compile/execute boundary between the
//!   scheduler and orchestrators, local or over TCP.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use grader::{Grader, INTERNAL_ERROR_SCORE};
pub use isolate::{IsolateError, Sandbox};
pub use manager::{BoxManager, CompileError, ManagerPool};
pub use protocol::{EvalClient, EvalServer, Evaluator, ExecuteStream, ProtocolError, TestStatus};
pub use store::{DiskStorage, MemoryStore, SubmissionStore, TestStorage};
pub use submission::{Submission, SubmissionStatus};
pub use types::{ExecutionStatus, ResourceLimits, RunMeta, TestLimits};

pub mod config;
pub mod grader;
pub mod isolate;
pub mod manager;
pub mod protocol;
pub mod store;
pub mod submission;
pub mod types;

#[cfg(test)]
mod test_support;
