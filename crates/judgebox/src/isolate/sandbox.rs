//! Box lifecycle and file staging for a single isolate box

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::isolate::IsolateError;
use crate::isolate::command::{IsolateAction, IsolateCommand};
use crate::isolate::process::{ExecOutput, run_isolate, spawn_isolate};
use crate::types::DirRule;

/// What isolate prints when `--init` hits a box left over from a previous run
const BOX_EXISTS: &str = "Box already exists";

/// Base configuration shared by every run in a box
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub isolate_path: PathBuf,
    pub cgroup: bool,
    /// Meta files are written here, outside the box
    pub meta_dir: PathBuf,
    /// Directory rules applied to every run
    pub dirs: Vec<DirRule>,
    /// How many times a stale box is cleaned up and `--init` retried
    pub init_retries: u32,
}

impl SandboxSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            isolate_path: config.isolate_binary(),
            cgroup: config.cgroup,
            meta_dir: config.meta_dir.clone(),
            dirs: config.sandbox_dirs.clone(),
            init_retries: config.grader.reset_retries,
        }
    }
}

/// An initialized isolate box
///
/// Call [`cleanup()`](Self::cleanup) before dropping; `Drop` only makes a
/// best-effort attempt from a detached thread.
#[derive(Debug)]
pub struct Sandbox {
    id: u32,
    box_path: PathBuf,
    settings: Arc<SandboxSettings>,
    initialized: bool,
}

impl Sandbox {
    /// Run `isolate --init` for box `id`.
    ///
    /// A box left behind by a crashed run is cleaned up and the init retried,
    /// at most `settings.init_retries` times.
    #[instrument(skip(settings))]
    pub async fn init(id: u32, settings: Arc<SandboxSettings>) -> Result<Self, IsolateError> {
        let mut attempt = 0;
        loop {
            let args = IsolateCommand::new(&settings.isolate_path, id)
                .action(IsolateAction::Init)
                .cgroup(settings.cgroup)
                .build();
            debug!(?args, "initializing isolate box");

            let output = spawn_isolate(&args, None).await?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if output.status.success() {
                let box_path = PathBuf::from(stdout.trim());
                if tokio::fs::metadata(&box_path).await.is_err() {
                    return Err(IsolateError::InitFailed {
                        id,
                        message: format!("box path does not exist: {}", box_path.display()),
                    });
                }
                info!(id, box_path = %box_path.display(), "box initialized");
                return Ok(Self {
                    id,
                    box_path,
                    settings,
                    initialized: true,
                });
            }

            let stale = stdout.starts_with(BOX_EXISTS) || stderr.starts_with(BOX_EXISTS);
            if !stale || attempt >= settings.init_retries {
                return Err(IsolateError::InitFailed {
                    id,
                    message: stderr.trim().to_string(),
                });
            }

            attempt += 1;
            warn!(id, attempt, "box already exists, cleaning up before retrying");
            if let Err(e) = run_cleanup(&settings, id).await {
                warn!(id, error = %e, "cleanup of stale box failed");
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Private root of the box on the host
    pub fn path(&self) -> &Path {
        &self.box_path
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Host path of a file inside the box
    pub fn file_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_relative(name)?;
        Ok(self.box_path.join("box").join(name))
    }

    /// Path of a file as the sandboxed program sees it
    pub fn sandbox_path(&self, name: &str) -> Result<String, IsolateError> {
        check_relative(name)?;
        Ok(format!("/box/{name}"))
    }

    /// Where isolate writes the meta file for this box
    pub fn meta_path(&self) -> PathBuf {
        self.settings.meta_dir.join(format!("box-{}.meta", self.id))
    }

    #[instrument(skip(self, content), fields(box_id = self.id))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), IsolateError> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "wrote file to box");
        Ok(())
    }

    #[instrument(skip(self), fields(box_id = self.id))]
    pub async fn get_file(&self, name: &str) -> Result<Vec<u8>, IsolateError> {
        let path = self.file_path(name)?;
        let content = tokio::fs::read(&path).await.map_err(|e| not_found(e, &path))?;
        debug!(?path, len = content.len(), "read file from box");
        Ok(content)
    }

    #[instrument(skip(self), fields(box_id = self.id))]
    pub async fn remove_file(&self, name: &str) -> Result<(), IsolateError> {
        let path = self.file_path(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found(e, &path))
    }

    pub async fn file_exists(&self, name: &str) -> Result<bool, IsolateError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Stage a host file in the box and mark it executable
    #[instrument(skip(self), fields(box_id = self.id))]
    pub async fn copy_in(&self, host_path: &Path, name: &str) -> Result<(), IsolateError> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(host_path, &path)
            .await
            .map_err(|e| not_found(e, host_path))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        debug!(from = ?host_path, to = ?path, "copied file into box");
        Ok(())
    }

    /// Stream a file out of the box into `writer`, returning the byte count
    #[instrument(skip(self, writer), fields(box_id = self.id))]
    pub async fn copy_out<W>(&self, name: &str, writer: &mut W) -> Result<u64, IsolateError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = self.file_path(name)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(e, &path))?;
        let copied = tokio::io::copy(&mut file, writer).await?;
        writer.flush().await?;
        debug!(?path, copied, "copied file out of box");
        Ok(copied)
    }

    /// A run command carrying the box's base configuration.
    ///
    /// Callers layer their per-call overlay on top and hand the result to
    /// [`execute`](Self::execute); the base itself is never modified.
    pub fn command(&self) -> IsolateCommand {
        IsolateCommand::new(&self.settings.isolate_path, self.id)
            .action(IsolateAction::Run)
            .cgroup(self.settings.cgroup)
            .dirs(&self.settings.dirs)
    }

    /// Run a command in the box, feeding `stdin` to it when given
    #[instrument(skip(self, command, stdin), fields(box_id = self.id))]
    pub async fn execute(
        &self,
        command: IsolateCommand,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, IsolateError> {
        if !self.initialized {
            return Err(IsolateError::BoxNotInitialized(self.id));
        }
        let meta_path = self.meta_path();
        tokio::fs::create_dir_all(&self.settings.meta_dir).await?;

        run_isolate(command.meta_file(&meta_path).build(), stdin, &meta_path).await
    }

    /// Release the box. Safe to call repeatedly.
    #[must_use = "cleanup errors should be handled"]
    #[instrument(skip(self), fields(box_id = self.id))]
    pub async fn cleanup(&mut self) -> Result<(), IsolateError> {
        if !self.initialized {
            return Ok(());
        }
        run_cleanup(&self.settings, self.id).await?;
        self.initialized = false;
        debug!("box cleaned up");
        Ok(())
    }

    /// Drop the handle without another cleanup attempt, after
    /// [`cleanup`](Self::cleanup) failed and the id is about to be re-initialized
    pub(crate) fn abandon(mut self) {
        self.initialized = false;
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        warn!(
            box_id = self.id,
            box_path = %self.box_path.display(),
            "sandbox dropped without cleanup, attempting best-effort cleanup"
        );

        let args = IsolateCommand::new(&self.settings.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.settings.cgroup)
            .build();
        let id = self.id;
        std::thread::spawn(move || {
            let Some((program, rest)) = args.split_first() else {
                return;
            };
            match std::process::Command::new(program).args(rest).output() {
                Ok(output) if output.status.success() => {
                    debug!(box_id = id, "best-effort cleanup succeeded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(box_id = id, stderr = %stderr, "best-effort cleanup failed");
                }
                Err(e) => {
                    warn!(box_id = id, error = %e, "best-effort cleanup spawn failed");
                }
            }
        });
    }
}

async fn run_cleanup(settings: &SandboxSettings, id: u32) -> Result<(), IsolateError> {
    let args = IsolateCommand::new(&settings.isolate_path, id)
        .action(IsolateAction::Cleanup)
        .cgroup(settings.cgroup)
        .build();
    debug!(?args, "cleaning up isolate box");

    let output = spawn_isolate(&args, None).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IsolateError::CleanupFailed {
            id,
            message: stderr.trim().to_string(),
        });
    }
    Ok(())
}

fn check_relative(name: &str) -> Result<(), IsolateError> {
    if name.is_empty() || name.contains("..") || name.starts_with('/') {
        return Err(IsolateError::InvalidPath(format!(
            "path traversal not allowed: {name}"
        )));
    }
    Ok(())
}

fn not_found(error: std::io::Error, path: &Path) -> IsolateError {
    if error.kind() == std::io::ErrorKind::NotFound {
        IsolateError::NotFound(path.to_path_buf())
    } else {
        IsolateError::Io(error)
    }
}
