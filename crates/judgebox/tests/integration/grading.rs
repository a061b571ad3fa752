use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use judgebox::submission::{ProblemSettings, Test, TestResult};
use judgebox::types::TestLimits;
use judgebox::{
    BoxManager, DiskStorage, EvalClient, EvalServer, Evaluator, Grader, ManagerPool, MemoryStore,
    Submission, SubmissionStatus, TestStorage,
};
use tokio_util::sync::CancellationToken;

use super::{fixture_source, test_config};

/// Problem 1 sums two numbers over the console; tests 1 and 2 pass for a
/// correct solution, test 3 expects a wrong answer.
fn write_tests(data_dir: &Path) {
    for (test, input, output) in [(1, "1 2", "3"), (2, "40 2", "42"), (3, "5 5", "11")] {
        let input_path = data_dir.join("1/input").join(format!("{test}.txt"));
        let output_path = data_dir.join("1/output").join(format!("{test}.txt"));
        std::fs::create_dir_all(input_path.parent().unwrap()).unwrap();
        std::fs::create_dir_all(output_path.parent().unwrap()).unwrap();
        std::fs::write(input_path, input).unwrap();
        std::fs::write(output_path, output).unwrap();
    }
}

fn submission(id: u64, language: &str, source: &str) -> Submission {
    Submission {
        id,
        code: fixture_source(source),
        language: language.to_owned(),
        user_id: 1,
        problem_id: 1,
        status: SubmissionStatus::Waiting,
        compile_error: None,
        compile_message: None,
        score: 0,
        problem: ProblemSettings {
            io_stem: "sum".to_owned(),
            console_input: true,
            limits: TestLimits {
                time_limit: 1.0,
                memory_limit: 256 * 1024,
                stack_limit: 0,
            },
        },
        tests: (1..=3)
            .map(|test| {
                TestResult::new(
                    id * 10 + test,
                    Test {
                        id: test,
                        problem_id: 1,
                        weight: 10 * test as i32,
                        visible_id: test as u32,
                    },
                )
            })
            .collect(),
    }
}

async fn grade(store: &MemoryStore, storage: Arc<dyn TestStorage>, evaluators: Vec<Arc<dyn Evaluator>>) {
    let mut config = judgebox::config::GraderConfig::default();
    config.poll_interval_ms = 50;
    let grader = Grader::new(Arc::new(store.clone()), storage, evaluators, config);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(grader.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(120), async {
        while !store.all_done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("grading did not finish");
    cancel.cancel();
    handle.await.unwrap();
}

fn assert_graded(store: &MemoryStore) {
    let correct = store.get(1).unwrap();
    assert_eq!(correct.status, SubmissionStatus::Done);
    assert_eq!(correct.compile_error, Some(false));
    let messages: Vec<_> = correct.tests.iter().map(|t| t.message.as_str()).collect();
    assert_eq!(messages, vec!["Correct", "Correct", "Wrong Answer"]);
    assert_eq!(correct.score, 30);

    let broken = store.get(2).unwrap();
    assert_eq!(broken.status, SubmissionStatus::Done);
    assert_eq!(broken.compile_error, Some(true));
    assert!(broken.compile_message.unwrap().contains("error"));
    assert!(broken.tests.iter().all(|t| !t.done));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_grade_on_two_local_boxes() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path()));
    write_tests(&config.storage.data_dir);
    let storage: Arc<dyn TestStorage> = Arc::new(DiskStorage::new(config.storage.data_dir.clone()));

    let mut evaluators: Vec<Arc<dyn Evaluator>> = Vec::new();
    for id in [230, 231] {
        let manager = BoxManager::new(id, Arc::clone(&config), Arc::clone(&storage))
            .await
            .expect("Failed to create box manager");
        evaluators.push(Arc::new(Arc::new(manager)));
    }

    let store = MemoryStore::new(vec![
        submission(1, "cpp17", "sum.cpp"),
        submission(2, "cpp17", "compile_error.cpp"),
    ]);
    grade(&store, storage, evaluators).await;

    assert_graded(&store);
    let compiled: Vec<_> = std::fs::read_dir(&config.storage.compile_dir)
        .unwrap()
        .collect();
    assert!(compiled.is_empty(), "artifacts left behind");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_grade_on_remote_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.grader.first_box_id = 240;
    config.grader.box_count = 2;
    let config = Arc::new(config);
    write_tests(&config.storage.data_dir);
    let storage: Arc<dyn TestStorage> = Arc::new(DiskStorage::new(config.storage.data_dir.clone()));

    let pool = ManagerPool::new(Arc::clone(&config), Arc::clone(&storage))
        .await
        .expect("Failed to start manager pool");
    let server = EvalServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::new(pool))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let stop_worker = CancellationToken::new();
    let worker = tokio::spawn(server.run(stop_worker.clone()));

    let store = MemoryStore::new(vec![
        submission(1, "cpp17", "sum.cpp"),
        submission(2, "cpp17", "compile_error.cpp"),
    ]);
    let client: Arc<dyn Evaluator> = Arc::new(EvalClient::new(addr.to_string()));
    grade(&store, storage, vec![Arc::clone(&client), client]).await;

    assert_graded(&store);
    stop_worker.cancel();
    worker.await.unwrap();
}
