use std::path::PathBuf;

use judgebox::config::Config;
use judgebox::types::{DirOption, DirRule};

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{}/configs/valid_full.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert!(config.languages.contains_key("cpp17"));
    assert!(config.languages.contains_key("python3"));
    assert_eq!(config.isolate_binary(), PathBuf::from("/usr/local/bin/isolate"));
    assert_eq!(
        config.sandbox_dirs,
        vec![DirRule::Mount {
            path: "/etc".to_owned(),
            options: vec![DirOption::Noexec],
        }]
    );
    assert_eq!(config.grader.box_count, 4);
    assert_eq!(config.grader.reset_retries, 5);
    assert_eq!(config.grader.compile_limits.time_limit, Some(15.0));
    assert_eq!(config.grader.compile_limits.wall_time_limit, None);
    assert_eq!(config.worker.listen.port(), 9000);

    let python = config.get_language("python3").unwrap();
    assert!(!python.is_compiled());
    assert_eq!(python.run_mounts().len(), 1);
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{}/configs/valid_minimal.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert!(config.languages.contains_key("test"));
    assert_eq!(config.grader.task_queue_size, 5);
}

#[test]
fn test_load_invalid_empty_name() {
    let path = format!("{}/configs/invalid_empty_name.toml", FIXTURES_PATH);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_invalid_empty_run_command() {
    let path = format!("{}/configs/invalid_empty_run_command.toml", FIXTURES_PATH);
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_invalid_queue_size() {
    let path = format!("{}/configs/invalid_queue_size.toml", FIXTURES_PATH);
    assert!(Config::from_file(&path).is_err());
}
