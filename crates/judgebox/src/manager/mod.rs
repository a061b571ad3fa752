//! Per-box orchestration of compiling and running submissions
//!
//! A [`BoxManager`] owns one isolate box. Compiles and test runs on the same
//! manager are serialized; parallelism comes from many managers with
//! distinct box ids, see [`ManagerPool`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};

pub use crate::manager::pool::{ManagerLease, ManagerPool};
use crate::config::{Config, ConfigError, Language};
use crate::isolate::{
    IsolateCommand, IsolateError, Sandbox, SandboxSettings, ensure_isolate, resolve_command,
};
use crate::protocol::{CompileRequest, CompileResponse, TestRequest, TestResponse, TestStatus};
use crate::store::TestStorage;
use crate::submission::CONSOLE_STEM;
use crate::types::{ExecutionStatus, ResourceLimits, RunMeta, TestLimits};

mod pool;

/// Combined compiler stdout and stderr, inside the box
const COMPILE_OUTPUT: &str = "compile.out";

#[derive(Debug, Error)]
pub enum CompileError {
    /// The compiler ran and rejected the source
    #[error("compilation failed")]
    Failed { output: String },

    #[error(transparent)]
    Sandbox(#[from] IsolateError),
}

/// Failures that turn a unit of work into an internal grader error
#[derive(Debug, Error)]
enum ManagerError {
    #[error(transparent)]
    Sandbox(#[from] IsolateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("compiled artifact for submission {0} is missing")]
    MissingArtifact(u64),

    #[error("failed to store compiled artifact: {0}")]
    Artifact(#[source] std::io::Error),
}

/// Orchestrates compile and run steps inside a single isolate box
pub struct BoxManager {
    id: u32,
    config: Arc<Config>,
    settings: Arc<SandboxSettings>,
    storage: Arc<dyn TestStorage>,
    /// Queues compiles behind each other
    compile_lock: Mutex<()>,
    /// Queues test runs behind each other
    execution_lock: Mutex<()>,
    /// Held for a whole unit of work, so a compile and a test run on the
    /// same box never overlap either. `None` after a failed reset; the next
    /// unit of work re-initializes.
    sandbox: Mutex<Option<Sandbox>>,
}

impl std::fmt::Debug for BoxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxManager").field("id", &self.id).finish()
    }
}

impl BoxManager {
    /// Create a manager for box `id`, initializing the box right away
    #[instrument(skip(config, storage))]
    pub async fn new(
        id: u32,
        config: Arc<Config>,
        storage: Arc<dyn TestStorage>,
    ) -> Result<Self, IsolateError> {
        let settings = Arc::new(SandboxSettings::from_config(&config));
        let manager = Self {
            id,
            config,
            settings,
            storage,
            compile_lock: Mutex::new(()),
            execution_lock: Mutex::new(()),
            sandbox: Mutex::new(None),
        };
        *manager.sandbox.lock().await = Some(manager.init_sandbox().await?);
        Ok(manager)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the compile cache keeps a submission's artifact
    pub fn artifact_path(&self, submission_id: u64) -> PathBuf {
        self.config
            .storage
            .compile_dir
            .join(format!("{submission_id}.bin"))
    }

    async fn init_sandbox(&self) -> Result<Sandbox, IsolateError> {
        ensure_isolate(&self.config.provision, &self.settings.isolate_path).await?;
        Sandbox::init(self.id, Arc::clone(&self.settings)).await
    }

    /// Lock the box for a unit of work, re-initializing it if a reset failed
    async fn lock_sandbox(&self) -> Result<MutexGuard<'_, Option<Sandbox>>, IsolateError> {
        let mut slot = self.sandbox.lock().await;
        if slot.is_none() {
            info!(id = self.id, "re-initializing box");
            *slot = Some(self.init_sandbox().await?);
        }
        Ok(slot)
    }

    /// Compile `source` in the box and leave the artifact there.
    ///
    /// Interpreted languages only get their source written.
    pub async fn compile(&self, source: &[u8], language: &Language) -> Result<String, CompileError> {
        let slot = self.lock_sandbox().await?;
        let sandbox = occupied(&slot, self.id)?;
        self.compile_in(sandbox, source, language).await
    }

    #[instrument(skip(self, sandbox, source, language), fields(box_id = self.id, language = %language.name))]
    async fn compile_in(
        &self,
        sandbox: &Sandbox,
        source: &[u8],
        language: &Language,
    ) -> Result<String, CompileError> {
        sandbox.write_file(&language.source_name(), source).await?;

        let Some(mut command) = language.compile_command() else {
            return Ok(String::new());
        };
        if let Err(e) = resolve_command(&mut command) {
            warn!(error = %e, "using compile command as configured");
        }

        let run = sandbox
            .command()
            .limits(self.config.compile_limits(language))
            .full_env(true)
            .dirs(&language.mounts)
            .env(&language.build_env())
            .stdout(sandbox.sandbox_path(COMPILE_OUTPUT)?)
            .stderr_to_stdout(true)
            .command(command);
        let result = sandbox.execute(run, None).await?;

        let mut output = match sandbox.get_file(COMPILE_OUTPUT).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(IsolateError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = sandbox.remove_file(COMPILE_OUTPUT).await {
            debug!(error = %e, "compile output not removed");
        }

        if !result.meta.is_success() {
            if matches!(
                result.meta.status,
                ExecutionStatus::Timeout | ExecutionStatus::SandboxError
            ) {
                output.push_str(&result.meta.diagnostic());
            }
            debug!(status = ?result.meta.status, "compilation failed");
            return Err(CompileError::Failed { output });
        }

        sandbox.remove_file(&language.source_name()).await?;
        Ok(output)
    }

    /// Run the staged program once under `limits`
    pub async fn run_test(
        &self,
        language: &Language,
        limits: &TestLimits,
        console_input: bool,
        io_stem: &str,
    ) -> Result<RunMeta, IsolateError> {
        let slot = self.lock_sandbox().await?;
        let sandbox = occupied(&slot, self.id)?;
        self.run_in(sandbox, language, limits, console_input, io_stem)
            .await
    }

    async fn run_in(
        &self,
        sandbox: &Sandbox,
        language: &Language,
        limits: &TestLimits,
        console_input: bool,
        io_stem: &str,
    ) -> Result<RunMeta, IsolateError> {
        let mut command = language.run_command();
        if let Err(e) = resolve_command(&mut command) {
            warn!(error = %e, "using run command as configured");
        }

        let test_limits = ResourceLimits::for_test(limits, &self.config.grader.wall_time());
        let limits = match language.run.limits {
            Some(ref base) => base.with_overrides(&test_limits),
            None => test_limits,
        };

        let mut run = sandbox
            .command()
            .limits(limits)
            .dirs(&language.run_mounts())
            .env(&language.run_env())
            .command(command);
        if console_input {
            run = run
                .stdin(sandbox.sandbox_path(&format!("{io_stem}.in"))?)
                .stdout(sandbox.sandbox_path(&format!("{io_stem}.out"))?);
        }

        Ok(sandbox.execute(run, None).await?.meta)
    }

    /// Run one test of a compiled submission.
    ///
    /// The box is reset afterwards no matter how the run ended.
    #[instrument(skip(self, request), fields(box_id = self.id, submission = request.submission_id, test = request.test_id))]
    pub async fn execute_test(&self, request: TestRequest) -> TestResponse {
        let _exclusive = self.execution_lock.lock().await;
        let test_id = request.test_id;

        let mut slot = match self.lock_sandbox().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "box unavailable");
                return TestResponse::internal(test_id, format!("sandbox unavailable: {e}"));
            }
        };

        let outcome = match slot.as_ref() {
            Some(sandbox) => self.execute_in(sandbox, &request).await,
            None => Err(IsolateError::BoxNotInitialized(self.id).into()),
        };
        let reset = self.reset_slot(&mut slot).await;

        match (outcome, reset) {
            (Ok(response), Ok(())) => response,
            (Ok(_), Err(e)) => TestResponse::internal(test_id, format!("sandbox reset failed: {e}")),
            (Err(e), _) => {
                warn!(error = %e, "test run failed");
                TestResponse::internal(test_id, e.to_string())
            }
        }
    }

    async fn execute_in(
        &self,
        sandbox: &Sandbox,
        request: &TestRequest,
    ) -> Result<TestResponse, ManagerError> {
        let language = self.config.get_language(&request.language)?;
        let stem = request.output_stem.as_str();
        let console_input = stem == CONSOLE_STEM;

        sandbox
            .write_file(&format!("{stem}.in"), request.input.as_bytes())
            .await?;
        match sandbox
            .copy_in(
                &self.artifact_path(request.submission_id),
                &language.compiled_name(),
            )
            .await
        {
            Ok(()) => {}
            Err(IsolateError::NotFound(_)) => {
                return Err(ManagerError::MissingArtifact(request.submission_id));
            }
            Err(e) => return Err(e.into()),
        }

        let meta = self
            .run_in(sandbox, language, &request.limits, console_input, stem)
            .await?;

        let mut response = TestResponse {
            test_id: request.test_id,
            output: String::new(),
            time: meta.time,
            memory: meta.memory,
            status: match meta.status {
                ExecutionStatus::Ok => TestStatus::Ok,
                ExecutionStatus::Timeout => TestStatus::Timeout,
                ExecutionStatus::RuntimeError { .. } => TestStatus::RuntimeError,
                ExecutionStatus::SandboxError => TestStatus::SandboxError,
            },
            comments: meta.diagnostic(),
        };

        match sandbox.get_file(&format!("{stem}.out")).await {
            Ok(output) => {
                self.persist_output(request, &output).await;
                response.output = String::from_utf8_lossy(&output).into_owned();
            }
            Err(IsolateError::NotFound(_)) => {
                if response.status == TestStatus::Ok {
                    response.status = TestStatus::MissingOutput;
                    response.comments = "Missing output file".to_owned();
                }
            }
            Err(e) => return Err(e.into()),
        }

        Ok(response)
    }

    /// Keep a durable copy of the program's output; failures only lose the copy
    async fn persist_output(&self, request: &TestRequest, output: &[u8]) {
        let result = async {
            let mut sink = self
                .storage
                .submission_output(request.submission_id, request.test_id)
                .await?;
            sink.write_all(output).await?;
            sink.shutdown().await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = format!("{e:#}"), "could not store submission output");
        }
    }

    /// Compile a submission and cache the artifact as `<submission id>.bin`.
    ///
    /// Interpreted languages cache their source. Repeating the call replaces
    /// the artifact atomically.
    #[instrument(skip(self, request), fields(box_id = self.id, submission = request.submission_id))]
    pub async fn compile_submission(&self, request: CompileRequest) -> CompileResponse {
        let _exclusive = self.compile_lock.lock().await;
        let submission_id = request.submission_id;

        let language = match self.config.get_language(&request.language) {
            Ok(language) => language,
            Err(e) => return CompileResponse::internal(submission_id, e.to_string()),
        };

        let mut slot = match self.lock_sandbox().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "box unavailable");
                return CompileResponse::internal(submission_id, format!("sandbox unavailable: {e}"));
            }
        };

        let outcome = match slot.as_ref() {
            Some(sandbox) => self.compile_and_store(sandbox, language, &request).await,
            None => Err(CompileError::Sandbox(IsolateError::BoxNotInitialized(self.id)).into()),
        };
        let reset = self.reset_slot(&mut slot).await;

        let mut response = match outcome {
            Ok(output) => CompileResponse {
                submission_id,
                success: true,
                output,
                other: String::new(),
            },
            Err(StoreError::Compile(CompileError::Failed { output })) => CompileResponse {
                submission_id,
                success: false,
                output,
                other: String::new(),
            },
            Err(e) => {
                warn!(error = %e, "compilation could not complete");
                CompileResponse::internal(submission_id, e.to_string())
            }
        };
        if let Err(e) = reset {
            response.success = false;
            response.other = format!("sandbox reset failed: {e}");
        }
        info!(success = response.success, "compile finished");
        response
    }

    async fn compile_and_store(
        &self,
        sandbox: &Sandbox,
        language: &Language,
        request: &CompileRequest,
    ) -> Result<String, StoreError> {
        let output = self
            .compile_in(sandbox, request.code.as_bytes(), language)
            .await?;

        let artifact = self.artifact_path(request.submission_id);
        let staging = artifact.with_extension(format!("bin.box{}", self.id));
        if let Some(parent) = artifact.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ManagerError::Artifact)?;
        }

        let staged = async {
            let mut file = tokio::fs::File::create(&staging)
                .await
                .map_err(ManagerError::Artifact)?;
            if language.is_compiled() {
                sandbox
                    .copy_out(&language.compiled_name(), &mut file)
                    .await?;
            } else {
                file.write_all(request.code.as_bytes())
                    .await
                    .map_err(ManagerError::Artifact)?;
                file.flush().await.map_err(ManagerError::Artifact)?;
            }
            Ok::<_, ManagerError>(())
        }
        .await;
        if let Err(e) = staged {
            discard(&staging).await;
            return Err(e.into());
        }

        tokio::fs::rename(&staging, &artifact)
            .await
            .map_err(ManagerError::Artifact)?;
        debug!(artifact = %artifact.display(), "artifact stored");
        Ok(output)
    }

    /// Clean up and re-initialize the box.
    ///
    /// Tries `reset_retries` times; afterwards the box stays released and
    /// the next unit of work initializes it again.
    pub async fn reset(&self) -> Result<(), IsolateError> {
        let mut slot = self.sandbox.lock().await;
        self.reset_slot(&mut slot).await
    }

    async fn reset_slot(&self, slot: &mut Option<Sandbox>) -> Result<(), IsolateError> {
        let attempts = self.config.grader.reset_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if let Some(mut sandbox) = slot.take()
                && let Err(e) = sandbox.cleanup().await
            {
                warn!(id = self.id, attempt, error = %e, "box cleanup failed");
                sandbox.abandon();
            }

            match self.init_sandbox().await {
                Ok(sandbox) => {
                    *slot = Some(sandbox);
                    return Ok(());
                }
                Err(e) => {
                    warn!(id = self.id, attempt, error = %e, "box re-initialization failed");
                    last_error = Some(e);
                }
            }
        }

        error!(id = self.id, attempts, "giving up on box reset");
        Err(last_error.unwrap_or(IsolateError::BoxNotInitialized(self.id)))
    }

    /// Delete a submission's cached artifact, if any
    pub async fn remove_artifact(&self, submission_id: u64) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.artifact_path(submission_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Release the box at shutdown
    pub async fn cleanup(&self) {
        let mut slot = self.sandbox.lock().await;
        if let Some(mut sandbox) = slot.take()
            && let Err(e) = sandbox.cleanup().await
        {
            warn!(id = self.id, error = %e, "box cleanup failed at shutdown");
            sandbox.abandon();
        }
    }
}

/// Errors of the compile-and-cache step
#[derive(Debug, Error)]
enum StoreError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl From<IsolateError> for StoreError {
    fn from(e: IsolateError) -> Self {
        StoreError::Manager(e.into())
    }
}

fn occupied(slot: &Option<Sandbox>, id: u32) -> Result<&Sandbox, IsolateError> {
    slot.as_ref().ok_or(IsolateError::BoxNotInitialized(id))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "staging file not removed");
    }
}
