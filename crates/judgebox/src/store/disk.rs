use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::store::{OutputSink, TestStorage};

/// Test storage on the local filesystem
///
/// ```text
/// <root>/<problem>/input/<test>.txt
/// <root>/<problem>/output/<test>.txt
/// <root>/submissions/<submission>/<test>.out
/// ```
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_path(&self, problem_id: u64, test_id: u64) -> PathBuf {
        self.root
            .join(problem_id.to_string())
            .join("input")
            .join(format!("{test_id}.txt"))
    }

    pub fn output_path(&self, problem_id: u64, test_id: u64) -> PathBuf {
        self.root
            .join(problem_id.to_string())
            .join("output")
            .join(format!("{test_id}.txt"))
    }

    pub fn submission_output_path(&self, submission_id: u64, test_id: u64) -> PathBuf {
        self.root
            .join("submissions")
            .join(submission_id.to_string())
            .join(format!("{test_id}.out"))
    }
}

#[async_trait]
impl TestStorage for DiskStorage {
    async fn test_input(&self, problem_id: u64, test_id: u64) -> Result<Vec<u8>> {
        let path = self.input_path(problem_id, test_id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read test input {}", path.display()))
    }

    async fn test_output(&self, problem_id: u64, test_id: u64) -> Result<Vec<u8>> {
        let path = self.output_path(problem_id, test_id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read expected output {}", path.display()))
    }

    async fn submission_output(&self, submission_id: u64, test_id: u64) -> Result<OutputSink> {
        let path = self.submission_output_path(submission_id, test_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Box::new(file))
    }
}
