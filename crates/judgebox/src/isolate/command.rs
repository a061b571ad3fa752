//! Command builder for the Isolate CLI
//!
//! Builds command-line arguments for the Isolate sandbox tool.

use std::path::{Path, PathBuf};

use crate::types::{DirRule, EnvRule, ResourceLimits};

/// Builder for Isolate command-line arguments
#[derive(Debug)]
pub struct IsolateCommand {
    /// Path to Isolate binary
    isolate_path: PathBuf,
    /// One of --init, --run, --cleanup
    action: IsolateAction,
    /// -b, --box-id
    box_id: u32,
    limits: ResourceLimits,
    dirs: Vec<DirRule>,
    /// -E, --env
    env: Vec<EnvRule>,
    /// -e, --full-env
    full_env: bool,
    /// -M, --meta
    meta_file: Option<PathBuf>,
    /// -i, --stdin
    stdin: Option<String>,
    /// -o, --stdout
    stdout: Option<String>,
    /// -r, --stderr
    stderr: Option<String>,
    stderr_to_stdout: bool,
    working_dir: Option<String>,
    command: Vec<String>,
    cgroup: bool,
}

impl IsolateCommand {
    /// Create a new isolate command builder
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            action: IsolateAction::Run,
            box_id,
            limits: ResourceLimits::default(),
            dirs: Vec::new(),
            env: Vec::new(),
            full_env: false,
            meta_file: None,
            stdin: None,
            stdout: None,
            stderr: None,
            stderr_to_stdout: false,
            working_dir: None,
            command: Vec::new(),
            cgroup: false,
        }
    }

    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Add directory rules, in order
    pub fn dirs<'a>(mut self, dirs: impl IntoIterator<Item = &'a DirRule>) -> Self {
        self.dirs.extend(dirs.into_iter().cloned());
        self
    }

    /// Add environment rules, in order
    pub fn env<'a>(mut self, env: impl IntoIterator<Item = &'a EnvRule>) -> Self {
        self.env.extend(env.into_iter().cloned());
        self
    }

    /// Set the meta file path for execution results
    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    /// Set stdin file path, as seen from inside the sandbox
    pub fn stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Set stdout file path, as seen from inside the sandbox
    pub fn stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Set stderr file path, as seen from inside the sandbox
    pub fn stderr(mut self, path: impl Into<String>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    /// Merge stderr into stdout
    pub fn stderr_to_stdout(mut self, enable: bool) -> Self {
        self.stderr_to_stdout = enable;
        self
    }

    /// Set the working directory inside the sandbox
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Pass the caller's full environment into the sandbox
    pub fn full_env(mut self, enable: bool) -> Self {
        self.full_env = enable;
        self
    }

    /// Enable cgroup support for memory limiting
    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    /// Build the command-line arguments
    ///
    /// Consumes self to avoid cloning the command vector.
    pub fn build(self) -> Vec<String> {
        let mut args = vec![self.isolate_path.to_string_lossy().into_owned()];

        args.push(format!("--box-id={}", self.box_id));

        if self.cgroup {
            args.push("--cg".to_string());
        }

        match self.action {
            IsolateAction::Init => {
                args.push("--init".to_string());
            }
            IsolateAction::Cleanup => {
                args.push("--cleanup".to_string());
            }
            IsolateAction::Run => {
                args.push("--run".to_string());

                if let Some(time) = self.limits.time_limit {
                    args.push(format!("--time={time}"));
                }
                if let Some(wall_time) = self.limits.wall_time_limit {
                    args.push(format!("--wall-time={wall_time}"));
                }
                if let Some(extra_time) = self.limits.extra_time {
                    args.push(format!("--extra-time={extra_time}"));
                }
                if let Some(memory) = self.limits.memory_limit {
                    if self.cgroup {
                        args.push(format!("--cg-mem={memory}"));
                    } else {
                        args.push(format!("--mem={memory}"));
                    }
                }
                if let Some(stack) = self.limits.stack_limit {
                    args.push(format!("--stack={stack}"));
                }
                match self.limits.max_processes {
                    Some(0) => args.push("--processes".to_string()),
                    Some(procs) => args.push(format!("--processes={procs}")),
                    None => {}
                }
                if let Some(fsize) = self.limits.max_output {
                    args.push(format!("--fsize={fsize}"));
                }
                if let Some(open_files) = self.limits.max_open_files {
                    args.push(format!("--open-files={open_files}"));
                }

                args.extend(self.dirs.iter().map(DirRule::to_flag));

                if self.full_env {
                    args.push("--full-env".to_string());
                }
                args.extend(self.env.iter().map(|rule| format!("--env={rule}")));

                if let Some(ref meta) = self.meta_file {
                    args.push(format!("--meta={}", meta.display()));
                }

                if let Some(ref stdin) = self.stdin {
                    args.push(format!("--stdin={stdin}"));
                }
                if let Some(ref stdout) = self.stdout {
                    args.push(format!("--stdout={stdout}"));
                }
                if let Some(ref stderr) = self.stderr {
                    args.push(format!("--stderr={stderr}"));
                }
                if self.stderr_to_stdout {
                    args.push("--stderr-to-stdout".to_string());
                }

                if let Some(ref dir) = self.working_dir {
                    args.push(format!("--chdir={dir}"));
                }

                args.push("--".to_string());
                args.extend(self.command);
            }
        }

        args
    }

    pub fn isolate_path(&self) -> &Path {
        &self.isolate_path
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    /// Initialize a new box
    Init,
    /// Run a command in the box
    Run,
    /// Clean up a box
    Cleanup,
}
