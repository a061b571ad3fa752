//! Parsing of the `key:value` meta file isolate writes after each run

use std::collections::HashMap;
use std::path::Path;

use crate::isolate::IsolateError;
use crate::types::{ExecutionStatus, RunMeta};

/// Raw meta file contents
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    entries: HashMap<String, String>,
}

impl MetaFile {
    /// Parse meta file content, skipping lines without a `key:` prefix.
    ///
    /// Values keep everything after the first colon, so messages such as
    /// `message:Error at 12:30:45` survive intact.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();

        Self { entries }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IsolateError::MetaUnreadable {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Peak memory in kilobytes; cgroup accounting wins over max-rss
    pub fn memory(&self) -> u64 {
        self.get_parsed("cg-mem")
            .or_else(|| self.get_parsed("max-rss"))
            .unwrap_or(0)
    }

    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus::from_isolate(self.get("status"), self.get_parsed("exitsig"))
    }

    pub fn to_run_meta(&self) -> RunMeta {
        RunMeta {
            status: self.status(),
            time: self.get_parsed("time").unwrap_or(0.0),
            wall_time: self.get_parsed("time-wall").unwrap_or(0.0),
            memory: self.memory(),
            exit_code: self.get_parsed("exitcode"),
            killed: self.get("killed").is_some(),
            message: self.get("message").map(str::to_owned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_meta() {
        let content = r#"
time:0.042
time-wall:0.050
max-rss:3456
exitcode:0
"#;
        let meta = MetaFile::parse(content).to_run_meta();

        assert_eq!(meta.status, ExecutionStatus::Ok);
        assert!((meta.time - 0.042).abs() < 0.001);
        assert!((meta.wall_time - 0.050).abs() < 0.001);
        assert_eq!(meta.memory, 3456);
        assert_eq!(meta.exit_code, Some(0));
        assert!(!meta.killed);
        assert!(meta.is_success());
    }

    #[test]
    fn test_parse_timeout_meta() {
        let content = r#"
time:2.001
time-wall:2.500
max-rss:1234
killed:1
status:TO
message:Time limit exceeded
"#;
        let meta = MetaFile::parse(content).to_run_meta();

        assert_eq!(meta.status, ExecutionStatus::Timeout);
        assert!(meta.killed);
        assert_eq!(meta.message.as_deref(), Some("Time limit exceeded"));
        assert_eq!(meta.diagnostic(), "TLE: Time limit exceeded");
    }

    #[test]
    fn test_parse_runtime_error_meta() {
        let content = "time:0.010\nexitcode:1\nstatus:RE\nmessage:Exited with error status 1\n";
        let meta = MetaFile::parse(content).to_run_meta();

        assert_eq!(meta.status, ExecutionStatus::RuntimeError { signal: None });
        assert_eq!(meta.exit_code, Some(1));
        assert!(!meta.is_success());
    }

    #[test]
    fn test_parse_signal_meta() {
        let content = r#"
time:0.010
time-wall:0.020
max-rss:1000
exitsig:11
status:SG
message:Caught fatal signal 11
"#;
        let meta = MetaFile::parse(content).to_run_meta();

        assert_eq!(
            meta.status,
            ExecutionStatus::RuntimeError { signal: Some(11) }
        );
        assert_eq!(meta.diagnostic(), "Caught fatal signal 11");
    }

    #[test]
    fn test_parse_internal_error_meta() {
        let meta = MetaFile::parse("status:XX\nmessage:Cannot run proxy\n").to_run_meta();
        assert_eq!(meta.status, ExecutionStatus::SandboxError);
        assert_eq!(meta.diagnostic(), "Sandbox Error: Cannot run proxy");
    }

    #[test]
    fn test_prefers_cgroup_memory() {
        let meta = MetaFile::parse("time:0.100\ncg-mem:524288\nmax-rss:512000\n");
        assert_eq!(meta.memory(), 524288);
    }

    #[test]
    fn test_value_with_colon() {
        let meta = MetaFile::parse("message:Error at 12:30:45");
        assert_eq!(meta.get("message"), Some("Error at 12:30:45"));
    }

    #[test]
    fn test_lenient_parsing_skips_garbage() {
        let meta = MetaFile::parse("time:0.042\ninvalid line\n:orphan\nexitcode:0").to_run_meta();
        assert!((meta.time - 0.042).abs() < 0.001);
        assert_eq!(meta.exit_code, Some(0));
    }

    #[test]
    fn test_empty_meta_is_clean_exit() {
        let meta = MetaFile::parse("").to_run_meta();
        assert_eq!(meta, RunMeta::default());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = MetaFile::load("/nonexistent/judgebox/box-0.meta")
            .await
            .unwrap_err();
        assert!(matches!(err, IsolateError::MetaUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box-3.meta");
        tokio::fs::write(&path, "time:1.5\nstatus:TO\n").await.unwrap();

        let meta = MetaFile::load(&path).await.unwrap().to_run_meta();
        assert_eq!(meta.status, ExecutionStatus::Timeout);
        assert!((meta.time - 1.5).abs() < 0.001);
    }
}
