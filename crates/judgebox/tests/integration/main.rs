//! Integration tests for judgebox
//!
//! These tests require the isolate binary to be installed and accessible.
//! Run with: cargo test -p judgebox --features integration-tests
//!
//! Tests that require root are marked `#[ignore]`. To include them:
//!    cargo test -p judgebox --features integration-tests -- --include-ignored
//!
//! Set `JUDGEBOX_TEST_CGROUP=1` when isolate is configured for cgroups.

#![cfg(feature = "integration-tests")]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use judgebox::config::Config;
use judgebox::{BoxManager, DiskStorage};

mod compilation;
mod config_loading;
mod execution;
mod grading;
mod meta_file_fixtures;
mod sandbox_lifecycle;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Default languages with all state kept under `work_dir`
pub(crate) fn test_config(work_dir: &Path) -> Config {
    let mut config = Config::default();
    config.cgroup = std::env::var_os("JUDGEBOX_TEST_CGROUP").is_some();
    config.meta_dir = work_dir.join("meta");
    config.storage.data_dir = work_dir.join("data");
    config.storage.compile_dir = work_dir.join("compiled");
    config
}

pub(crate) async fn manager(box_id: u32, work_dir: &Path) -> BoxManager {
    let config = test_config(work_dir);
    let storage = Arc::new(DiskStorage::new(config.storage.data_dir.clone()));
    BoxManager::new(box_id, Arc::new(config), storage)
        .await
        .expect("Failed to create box manager")
}
