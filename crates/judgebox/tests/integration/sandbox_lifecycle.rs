use std::sync::Arc;

use judgebox::isolate::{Sandbox, SandboxSettings};

use super::test_config;

fn settings(work_dir: &std::path::Path) -> Arc<SandboxSettings> {
    Arc::new(SandboxSettings::from_config(&test_config(work_dir)))
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_init_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let mut sandbox = Sandbox::init(200, settings(dir.path()))
        .await
        .expect("Failed to create sandbox");

    assert!(sandbox.path().exists());
    assert!(sandbox.is_initialized());

    sandbox.cleanup().await.expect("Failed to cleanup sandbox");
    assert!(!sandbox.is_initialized());
    // A second cleanup is a no-op
    sandbox.cleanup().await.expect("Repeated cleanup failed");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_write_and_read_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut sandbox = Sandbox::init(201, settings(dir.path()))
        .await
        .expect("Failed to create sandbox");

    let content = b"Hello, World!";
    sandbox
        .write_file("test.txt", content)
        .await
        .expect("Failed to write file");
    assert!(sandbox.file_exists("test.txt").await.unwrap());
    assert!(!sandbox.file_exists("nonexistent.txt").await.unwrap());

    let read_content = sandbox
        .get_file("test.txt")
        .await
        .expect("Failed to read file");
    assert_eq!(read_content, content);

    sandbox.cleanup().await.expect("Failed to cleanup");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_stale_box_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    // Leave box 202 initialized, as a crashed grader would
    let stale = Sandbox::init(202, Arc::clone(&settings))
        .await
        .expect("Failed to create sandbox");
    stale
        .write_file("leftover.txt", b"x")
        .await
        .expect("Failed to write file");
    std::mem::forget(stale);

    let mut sandbox = Sandbox::init(202, settings)
        .await
        .expect("Failed to reclaim stale box");
    assert!(sandbox.is_initialized());
    sandbox
        .write_file("fresh.txt", b"y")
        .await
        .expect("Reclaimed box is not writable");

    sandbox.cleanup().await.expect("Failed to cleanup");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_manager_reset_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = super::manager(203, dir.path()).await;

    manager.reset().await.expect("First reset failed");
    manager.reset().await.expect("Second reset failed");

    manager.cleanup().await;
}
