use judgebox::isolate::MetaFile;
use judgebox::types::{ExecutionStatus, RunMeta};

use super::FIXTURES_PATH;

fn load_meta_fixture(name: &str) -> RunMeta {
    let path = format!("{}/meta/{}", FIXTURES_PATH, name);
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read meta fixture {}: {}", path, e));
    MetaFile::parse(&content).to_run_meta()
}

#[test]
fn test_meta_success() {
    let meta = load_meta_fixture("success.meta");
    assert_eq!(meta.status, ExecutionStatus::Ok);
    assert_eq!(meta.exit_code, Some(0));
    assert!((meta.time - 0.042).abs() < 0.001);
    assert!(meta.is_success());
    assert_eq!(meta.diagnostic(), "");
}

#[test]
fn test_meta_tle() {
    let meta = load_meta_fixture("tle.meta");
    assert_eq!(meta.status, ExecutionStatus::Timeout);
    assert!(meta.killed);
    assert_eq!(meta.diagnostic(), "TLE: Time limit exceeded");
}

#[test]
fn test_meta_wall_tle() {
    let meta = load_meta_fixture("wall_tle.meta");
    assert_eq!(meta.status, ExecutionStatus::Timeout);
    assert!(meta.wall_time > meta.time);
}

#[test]
fn test_meta_signal() {
    let meta = load_meta_fixture("signal.meta");
    assert_eq!(
        meta.status,
        ExecutionStatus::RuntimeError { signal: Some(11) }
    );
    assert_eq!(meta.diagnostic(), "Caught fatal signal 11");
}

#[test]
fn test_meta_runtime_error() {
    let meta = load_meta_fixture("runtime_error.meta");
    assert_eq!(meta.status, ExecutionStatus::RuntimeError { signal: None });
    assert_eq!(meta.exit_code, Some(1));
    assert_eq!(meta.diagnostic(), "Runtime Error: Exited with error status 1");
}

#[test]
fn test_meta_internal_error() {
    let meta = load_meta_fixture("internal_error.meta");
    assert_eq!(meta.status, ExecutionStatus::SandboxError);
    assert!(meta.diagnostic().starts_with("Sandbox Error: Cannot run proxy"));
}

#[test]
fn test_meta_cgroup_mem_priority() {
    let meta = load_meta_fixture("cgroup_mem.meta");
    // cg-mem should be preferred over max-rss
    assert_eq!(meta.memory, 524288);
}
