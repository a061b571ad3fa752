use judgebox::BoxManager;
use judgebox::protocol::{CompileRequest, TestRequest, TestResponse, TestStatus};
use judgebox::submission::CONSOLE_STEM;
use judgebox::types::TestLimits;

use super::{fixture_source, manager};

async fn compile(manager: &BoxManager, submission_id: u64, language: &str, source: &str) {
    let response = manager
        .compile_submission(CompileRequest {
            submission_id,
            language: language.to_owned(),
            code: fixture_source(source),
        })
        .await;
    assert!(response.success, "compilation failed: {response:?}");
}

async fn run(
    manager: &BoxManager,
    submission_id: u64,
    language: &str,
    input: &str,
    stem: &str,
) -> TestResponse {
    manager
        .execute_test(TestRequest {
            test_id: 1,
            submission_id,
            language: language.to_owned(),
            input: input.to_owned(),
            output_stem: stem.to_owned(),
            limits: TestLimits {
                time_limit: 1.0,
                memory_limit: 256 * 1024,
                stack_limit: 0,
            },
        })
        .await
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_console_sum_is_correct() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(220, dir.path()).await;
    compile(&manager, 1, "cpp17", "sum.cpp").await;

    let response = run(&manager, 1, "cpp17", "2 40\n", CONSOLE_STEM).await;
    assert_eq!(response.status, TestStatus::Ok, "{response:?}");
    assert_eq!(response.output.trim(), "42");
    assert!(response.memory > 0);

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_file_io_sum_is_correct() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(221, dir.path()).await;
    compile(&manager, 2, "cpp17", "sum_files.cpp").await;

    let response = run(&manager, 2, "cpp17", "20 22\n", "sum").await;
    assert_eq!(response.status, TestStatus::Ok, "{response:?}");
    assert_eq!(response.output.trim(), "42");

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_interpreted_console_run() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(222, dir.path()).await;
    compile(&manager, 3, "python3", "sum.py").await;

    let response = run(&manager, 3, "python3", "1 2\n", CONSOLE_STEM).await;
    assert_eq!(response.status, TestStatus::Ok, "{response:?}");
    assert_eq!(response.output.trim(), "3");

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_time_limit_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(223, dir.path()).await;
    compile(&manager, 4, "cpp17", "infinite_loop.cpp").await;

    let response = run(&manager, 4, "cpp17", "", CONSOLE_STEM).await;
    assert_eq!(response.status, TestStatus::Timeout);
    assert!(response.comments.starts_with("TLE"));

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_segfault_is_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(224, dir.path()).await;
    compile(&manager, 5, "cpp17", "segfault.cpp").await;

    let response = run(&manager, 5, "cpp17", "", CONSOLE_STEM).await;
    assert_eq!(response.status, TestStatus::RuntimeError);
    assert!(response.comments.contains("signal 11"));

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_missing_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(225, dir.path()).await;
    compile(&manager, 6, "cpp17", "no_output.cpp").await;

    let response = run(&manager, 6, "cpp17", "1 1\n", "sum").await;
    assert_eq!(response.status, TestStatus::MissingOutput);

    manager.cleanup().await;
}
