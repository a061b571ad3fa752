//! Configuration file loading
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let grader = &self.grader;
        if grader.box_count == 0 {
            return Err(ConfigError::Invalid("grader.box_count must be at least 1".into()));
        }
        if grader.first_box_id.checked_add(grader.box_count).is_none() {
            return Err(ConfigError::Invalid(format!(
                "box ids {} + {} overflow",
                grader.first_box_id, grader.box_count
            )));
        }
        if grader.task_queue_size == 0 || grader.update_queue_size == 0 {
            return Err(ConfigError::Invalid("grader queue sizes must be at least 1".into()));
        }
        if grader.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("grader.poll_interval_ms must be positive".into()));
        }
        if grader.wall_time_ceiling <= 0.0 || grader.wall_time_margin < 0.0 {
            return Err(ConfigError::Invalid(
                "wall time ceiling must be positive and margin non-negative".into(),
            ));
        }

        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref compile) = lang.compile {
                if compile.command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has empty compile command"
                    )));
                }
                for name in [&compile.source_name, &compile.output_name] {
                    if name.is_empty() || name.contains('/') {
                        return Err(ConfigError::Invalid(format!(
                            "language '{id}' has invalid file name '{name}'"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
