//! IOI Isolate wrapper
//!
//! This module provides a Rust interface to Isolate, handling command building,
//! box lifecycle management, and result parsing.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::path::PathBuf;

use thiserror::Error;

pub use crate::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::isolate::meta::MetaFile;
pub use crate::isolate::process::ExecOutput;
pub use crate::isolate::provision::ensure_isolate;
pub use crate::isolate::sandbox::{Sandbox, SandboxSettings};

mod command;
mod meta;
mod process;
mod provision;
mod sandbox;

#[cfg(test)]
pub(crate) use crate::isolate::sandbox::tests::fake_sandbox;

/// Errors that occur during isolate sandbox operations
#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("isolate command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn isolate process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to read meta file {path}: {source}")]
    MetaUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("box {0} is not initialized")]
    BoxNotInitialized(u32),

    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("failed to download {url}: {source}")]
    ProvisionFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Resolve the program in a command to an absolute path using the host's PATH.
///
/// Isolate uses `execve` which does not search PATH, so commands must be
/// absolute paths or contain a `/`. Bare names like `g++` become their
/// canonical location on the host; anything containing a `/` is left alone.
pub fn resolve_command(command: &mut [String]) -> Result<(), IsolateError> {
    let Some(first) = command.first_mut() else {
        return Ok(());
    };

    if first.contains('/') {
        return Ok(());
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = std::path::Path::new(dir).join(&*first);
        if candidate.is_file() {
            // Symlinks are resolved so the target is reachable across bind mounts
            *first = std::fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            return Ok(());
        }
    }

    Err(IsolateError::CommandFailed(format!(
        "command '{first}' not found in PATH",
    )))
}
