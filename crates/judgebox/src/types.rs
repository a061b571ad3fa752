use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource limits for a single isolate run
///
/// Every field is optional; a `None` field emits no flag and leaves
/// isolate's own default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    #[serde(default)]
    pub time_limit: Option<f64>,

    /// Wall clock time limit in seconds
    #[serde(default)]
    pub wall_time_limit: Option<f64>,

    /// Extra time before killing (grace period) in seconds
    #[serde(default)]
    pub extra_time: Option<f64>,

    /// Memory limit in kilobytes
    #[serde(default)]
    pub memory_limit: Option<u64>,

    /// Stack size limit in kilobytes
    #[serde(default)]
    pub stack_limit: Option<u64>,

    /// Maximum number of processes/threads; `0` lifts the cap entirely
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum size of files created by the program, in kilobytes
    #[serde(default)]
    pub max_output: Option<u64>,

    /// Maximum open files
    #[serde(default)]
    pub max_open_files: Option<u32>,
}

impl ResourceLimits {
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn with_wall_time_limit(mut self, seconds: f64) -> Self {
        self.wall_time_limit = Some(seconds);
        self
    }

    pub fn with_memory_limit(mut self, kb: u64) -> Self {
        self.memory_limit = Some(kb);
        self
    }

    pub fn with_stack_limit(mut self, kb: u64) -> Self {
        self.stack_limit = Some(kb);
        self
    }

    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            time_limit: overrides.time_limit.or(self.time_limit),
            wall_time_limit: overrides.wall_time_limit.or(self.wall_time_limit),
            extra_time: overrides.extra_time.or(self.extra_time),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            stack_limit: overrides.stack_limit.or(self.stack_limit),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_output: overrides.max_output.or(self.max_output),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
        }
    }

    /// Build the limits for running one test.
    ///
    /// Zero values in `test` mean "not constrained". The wall clock always
    /// gets a bound: `time_limit + margin`, or `ceiling` when no CPU time
    /// limit was given.
    pub fn for_test(test: &TestLimits, wall_time: &WallTimePolicy) -> ResourceLimits {
        let time_limit = (test.time_limit > 0.0).then_some(test.time_limit);
        let wall_time_limit = match time_limit {
            Some(time) => time + wall_time.margin,
            None => wall_time.ceiling,
        };

        ResourceLimits {
            time_limit,
            wall_time_limit: Some(wall_time_limit),
            memory_limit: (test.memory_limit > 0).then_some(test.memory_limit),
            stack_limit: (test.stack_limit > 0).then_some(test.stack_limit),
            ..Default::default()
        }
    }
}

/// Problem constraints applied to every test of a submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TestLimits {
    /// Seconds of CPU time, `0` for none
    #[serde(default)]
    pub time_limit: f64,
    /// Kilobytes, `0` for none
    #[serde(default)]
    pub memory_limit: u64,
    /// Kilobytes, `0` for none
    #[serde(default)]
    pub stack_limit: u64,
}

/// How the wall clock bound is derived from a test's CPU time limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallTimePolicy {
    /// Seconds added on top of the CPU time limit
    pub margin: f64,
    /// Wall clock bound used when the test has no CPU time limit
    pub ceiling: f64,
}

impl Default for WallTimePolicy {
    fn default() -> Self {
        Self {
            margin: 1.0,
            ceiling: 15.0,
        }
    }
}

/// Structured metadata of one isolate run, parsed from its meta file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMeta {
    pub status: ExecutionStatus,

    /// CPU time used in seconds
    pub time: f64,

    /// Wall clock time used in seconds
    pub wall_time: f64,

    /// Peak memory usage in kilobytes (cg-mem preferred, fallback to max-rss)
    pub memory: u64,

    /// Exit code if the program exited normally
    pub exit_code: Option<i32>,

    /// Whether isolate had to kill the program
    pub killed: bool,

    /// Free-text message from isolate
    pub message: Option<String>,
}

impl RunMeta {
    /// The run finished normally with exit code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Ok && self.exit_code.unwrap_or(0) == 0
    }

    /// Human readable diagnosis of a run, empty for a clean exit
    pub fn diagnostic(&self) -> String {
        let message = self.message.as_deref().unwrap_or_default();
        match self.status {
            ExecutionStatus::Ok => String::new(),
            ExecutionStatus::Timeout => format!("TLE: {message}"),
            ExecutionStatus::RuntimeError { signal: None } => {
                format!("Runtime Error: {message}")
            }
            ExecutionStatus::RuntimeError { signal: Some(_) } => message.to_owned(),
            ExecutionStatus::SandboxError => format!("Sandbox Error: {message}"),
        }
    }
}

/// Outcome class of a sandboxed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Program exited on its own
    #[default]
    Ok,

    /// CPU or wall time limit exceeded
    Timeout,

    /// Non-zero exit, or killed by `signal`
    RuntimeError { signal: Option<i32> },

    /// isolate itself failed
    SandboxError,
}

impl ExecutionStatus {
    /// Map isolate's two-letter status code.
    ///
    /// isolate leaves the `status` key out of the meta file for clean exits.
    pub fn from_isolate(status: Option<&str>, signal: Option<i32>) -> Self {
        match status {
            None | Some("OK") => ExecutionStatus::Ok,
            Some("TO") => ExecutionStatus::Timeout,
            Some("RE") => ExecutionStatus::RuntimeError { signal: None },
            Some("SG") => ExecutionStatus::RuntimeError { signal },
            Some(_) => ExecutionStatus::SandboxError,
        }
    }
}

/// Options accepted by isolate's `--dir` rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirOption {
    /// Read-write mount
    Rw,
    /// Allow device files
    Dev,
    /// Disallow execution of binaries
    Noexec,
    /// Silently skip when the outside path does not exist
    Maybe,
    /// Mount a filesystem by name instead of a bind mount
    Fs,
    /// Temporary directory, removed on cleanup
    Tmp,
    /// Do not bind-mount recursively
    Norec,
}

impl DirOption {
    fn as_str(self) -> &'static str {
        match self {
            DirOption::Rw => "rw",
            DirOption::Dev => "dev",
            DirOption::Noexec => "noexec",
            DirOption::Maybe => "maybe",
            DirOption::Fs => "fs",
            DirOption::Tmp => "tmp",
            DirOption::Norec => "norec",
        }
    }
}

/// A directory rule for the sandbox filesystem
///
/// In configuration files the three forms are written as
/// `{ path = "/etc" }`, `{ inside = "/data", outside = "/srv/data", options = ["rw"] }`
/// and `{ remove = "/tmp" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirRule {
    /// Drop a directory that isolate would mount by default
    Remove { remove: String },

    /// Bind `outside` (host) to `inside` (sandbox)
    Bind {
        inside: String,
        outside: String,
        #[serde(default)]
        options: Vec<DirOption>,
    },

    /// Mount a host directory at the same path inside the sandbox
    Mount {
        path: String,
        #[serde(default)]
        options: Vec<DirOption>,
    },
}

impl DirRule {
    pub fn mount(path: impl Into<String>) -> Self {
        DirRule::Mount {
            path: path.into(),
            options: Vec::new(),
        }
    }

    pub fn bind(
        inside: impl Into<String>,
        outside: impl Into<String>,
        options: impl IntoIterator<Item = DirOption>,
    ) -> Self {
        DirRule::Bind {
            inside: inside.into(),
            outside: outside.into(),
            options: options.into_iter().collect(),
        }
    }

    pub fn remove(inside: impl Into<String>) -> Self {
        DirRule::Remove {
            remove: inside.into(),
        }
    }

    /// Render the rule as an isolate `--dir` argument
    pub fn to_flag(&self) -> String {
        match self {
            DirRule::Remove { remove } => format!("--dir={remove}="),
            DirRule::Bind {
                inside,
                outside,
                options,
            } => format!("--dir={inside}={outside}{}", render_options(options)),
            DirRule::Mount { path, options } => {
                format!("--dir={path}{}", render_options(options))
            }
        }
    }
}

fn render_options(options: &[DirOption]) -> String {
    options.iter().map(|o| format!(":{}", o.as_str())).collect()
}

/// An environment rule: `KEY=VALUE` sets a variable, a bare `KEY` inherits it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EnvRule {
    Set { key: String, value: String },
    Inherit { key: String },
}

impl EnvRule {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        EnvRule::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            EnvRule::Set { key, .. } | EnvRule::Inherit { key } => key,
        }
    }
}

impl TryFrom<String> for EnvRule {
    type Error = String;

    fn try_from(rule: String) -> Result<Self, Self::Error> {
        let (key, value) = match rule.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (rule.as_str(), None),
        };
        if key.is_empty() {
            return Err(format!("environment rule '{rule}' has an empty name"));
        }
        Ok(match value {
            Some(value) => EnvRule::set(key, value),
            None => EnvRule::Inherit {
                key: key.to_owned(),
            },
        })
    }
}

impl From<EnvRule> for String {
    fn from(rule: EnvRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for EnvRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvRule::Set { key, value } => write!(f, "{key}={value}"),
            EnvRule::Inherit { key } => write!(f, "{key}"),
        }
    }
}
