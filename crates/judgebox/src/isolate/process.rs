//! Process spawning and I/O for Isolate

use std::path::Path;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::isolate::IsolateError;
use crate::isolate::meta::MetaFile;
use crate::types::RunMeta;

/// Captured result of one `isolate --run`
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub meta: RunMeta,
}

/// Spawn a built isolate argument vector and wait for it.
///
/// `stdin` is written from a separate task so a program that fills its
/// stdout pipe before draining stdin cannot deadlock the caller.
pub(crate) async fn spawn_isolate(
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<Output, IsolateError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_string()))?;

    let mut child = Command::new(program)
        .args(rest)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(IsolateError::SpawnFailed)?;

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(data)) => {
            let data = data.to_vec();
            Some(tokio::spawn(async move {
                // A program that exits without reading its input closes the pipe early
                if let Err(e) = pipe.write_all(&data).await {
                    debug!(error = %e, "stdin pipe closed before all input was written");
                }
            }))
        }
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(IsolateError::SpawnFailed)?;

    if let Some(writer) = writer
        && let Err(e) = writer.await
    {
        warn!(error = %e, "stdin writer task failed");
    }

    Ok(output)
}

/// Run an `isolate --run` argument vector and collect its meta file.
///
/// A missing meta file means isolate never got as far as starting the
/// program; its stderr is the only diagnostic left.
pub(crate) async fn run_isolate(
    args: Vec<String>,
    stdin: Option<&[u8]>,
    meta_path: &Path,
) -> Result<ExecOutput, IsolateError> {
    debug!(?args, "running isolate command");

    match tokio::fs::remove_file(meta_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let output = spawn_isolate(&args, stdin).await?;

    if tokio::fs::metadata(meta_path).await.is_err() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IsolateError::CommandFailed(stderr.trim().to_string()));
    }
    let meta = MetaFile::load(meta_path).await?.to_run_meta();

    debug!(
        status = ?meta.status,
        time = meta.time,
        memory = meta.memory,
        "execution complete"
    );

    Ok(ExecOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        meta,
    })
}
