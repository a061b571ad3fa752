use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, DEFAULT_SANDBOX_PATH, FileExtension, Language, RunConfig,
};
use crate::types::{DirRule, ResourceLimits, WallTimePolicy};

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../judgebox.example.toml");

const ISOLATE_RELEASE: &str = "https://github.com/KiloProjects/isolate/releases/download/v2.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration, loaded once and shared read-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Run boxes under cgroups, limiting memory with `--cg-mem`.
    ///
    /// RLIMIT_AS based `--mem` counts virtual address space, which runtimes
    /// like the JVM and Go reserve in large amounts.
    #[serde(default)]
    pub cgroup: bool,

    /// Directory for isolate meta files; kept outside every box
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,

    /// Directory rules applied to every sandbox run
    #[serde(default)]
    pub sandbox_dirs: Vec<DirRule>,

    #[serde(default)]
    pub provision: ProvisionConfig,

    #[serde(default)]
    pub grader: GraderConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Language profiles keyed by language id
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

/// Downloading isolate on hosts that lack it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub enabled: bool,
    pub isolate_url: String,
    pub config_url: String,
    /// Where isolate expects its config file
    pub config_path: PathBuf,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            isolate_url: format!("{ISOLATE_RELEASE}/isolate"),
            config_url: format!("{ISOLATE_RELEASE}/default.cf"),
            config_path: PathBuf::from("/usr/local/etc/isolate"),
        }
    }
}

/// Scheduler and orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// How often the store is polled for waiting submissions
    pub poll_interval_ms: u64,
    pub task_queue_size: usize,
    pub update_queue_size: usize,
    /// Number of local box managers, one per box id
    pub box_count: u32,
    pub first_box_id: u32,
    /// Attempts made to reset a box before the current task fails
    pub reset_retries: u32,
    /// Seconds of wall time granted beyond the CPU time limit
    pub wall_time_margin: f64,
    /// Wall time bound when a problem sets no CPU time limit
    pub wall_time_ceiling: f64,
    /// Limits for compilation, overridable per language
    pub compile_limits: ResourceLimits,
}

impl GraderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wall_time(&self) -> WallTimePolicy {
        WallTimePolicy {
            margin: self.wall_time_margin,
            ceiling: self.wall_time_ceiling,
        }
    }

    /// Box ids handed to local managers
    pub fn box_ids(&self) -> impl Iterator<Item = u32> {
        self.first_box_id..self.first_box_id.saturating_add(self.box_count)
    }
}

impl Default for GraderConfig {
    fn default() -> Self {
        let wall_time = WallTimePolicy::default();
        Self {
            poll_interval_ms: 4000,
            task_queue_size: 5,
            update_queue_size: 20,
            box_count: 2,
            first_box_id: 1,
            reset_retries: 3,
            wall_time_margin: wall_time.margin,
            wall_time_ceiling: wall_time.ceiling,
            compile_limits: ResourceLimits {
                time_limit: Some(10.0),
                wall_time_limit: Some(20.0),
                memory_limit: Some(512 * ResourceLimits::MB),
                max_processes: Some(0),
                ..Default::default()
            },
        }
    }
}

/// Where durable files live on the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of test data and submission outputs
    pub data_dir: PathBuf,
    /// Compile cache holding `<submission id>.bin` artifacts
    pub compile_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/judgebox/data"),
            compile_dir: PathBuf::from("/var/lib/judgebox/compiled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the execution worker listens on
    pub listen: SocketAddr,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8001)),
        }
    }
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config with default settings and no languages
    pub fn empty() -> Self {
        Self {
            isolate_path: None,
            cgroup: false,
            meta_dir: default_meta_dir(),
            sandbox_dirs: Vec::new(),
            provision: ProvisionConfig::default(),
            grader: GraderConfig::default(),
            storage: StorageConfig::default(),
            worker: WorkerConfig::default(),
            languages: HashMap::new(),
        }
    }

    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }

    /// Compile limits for a language: the grader's, overridden by the profile's
    pub fn compile_limits(&self, language: &Language) -> ResourceLimits {
        match language.compile.as_ref().and_then(|c| c.limits.as_ref()) {
            Some(overrides) => self.grader.compile_limits.with_overrides(overrides),
            None => self.grader.compile_limits.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("/var/lib/judgebox/meta")
}
