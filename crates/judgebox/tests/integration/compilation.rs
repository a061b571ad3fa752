use judgebox::CompileError;
use judgebox::protocol::CompileRequest;

use super::{fixture_source, manager};

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_cpp_success() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(210, dir.path()).await;
    let language = manager.config().get_language("cpp17").unwrap().clone();

    manager
        .compile(fixture_source("hello.cpp").as_bytes(), &language)
        .await
        .expect("Compilation failed");

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_cpp_error_keeps_output() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(211, dir.path()).await;
    let language = manager.config().get_language("cpp17").unwrap().clone();

    let result = manager
        .compile(fixture_source("compile_error.cpp").as_bytes(), &language)
        .await;

    match result {
        Err(CompileError::Failed { output }) => assert!(output.contains("error")),
        other => panic!("expected compile failure, got {other:?}"),
    }

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_interpreted_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(212, dir.path()).await;
    let language = manager.config().get_language("python3").unwrap().clone();

    let output = manager
        .compile(fixture_source("sum.py").as_bytes(), &language)
        .await
        .expect("Interpreted compile failed");
    assert!(output.is_empty());

    manager.cleanup().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_submission_twice_leaves_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(213, dir.path()).await;
    let request = CompileRequest {
        submission_id: 77,
        language: "cpp17".to_owned(),
        code: fixture_source("sum.cpp"),
    };

    let first = manager.compile_submission(request.clone()).await;
    assert!(first.success, "{first:?}");
    let second = manager.compile_submission(request).await;
    assert!(second.success, "{second:?}");

    let entries: Vec<_> = std::fs::read_dir(&manager.config().storage.compile_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("77.bin")]);

    manager.cleanup().await;
}
