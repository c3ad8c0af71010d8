//! Process-wide registry tests
//!
//! Kept in one test function: the global registry is shared by every test
//! in this binary.

use logpipe::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_global_registry_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let log_file = temp_dir.path().join("global.log");

    assert!(matches!(
        logpipe::get_logger(LoggerOptions::new("early")),
        Err(LoggerError::NotInitialized)
    ));
    assert!(logpipe::logger("early").is_none());
    assert!(logpipe::backlog().is_empty());

    let config = LogConfig::builder()
        .formatter(|entry| format!("{} {}", entry.domain, entry.message))
        .build()
        .unwrap();
    let root = logpipe::log_init(config, LoggerOptions::default().path(&log_file)).unwrap();
    assert_eq!(root.domain(), "root");

    // Later configurations are ignored; the formatter above stays in effect
    let api = logpipe::log_init(
        LogConfig::default(),
        LoggerOptions::new("api").path(&log_file),
    )
    .unwrap();
    let db = logpipe::get_logger(LoggerOptions::new("db").path(&log_file)).unwrap();
    assert!(api.shares_file_with(&db));
    assert!(logpipe::logger("db").is_some());

    logpipe::set_backlog_size(4);
    root.info("starting").unwrap();
    api.info("listening").unwrap();
    db.error("connection lost").unwrap();
    assert_eq!(logpipe::backlog().len(), 3);

    logpipe::shutdown_all(false);
    assert!(logpipe::logger("api").is_none());
    assert!(matches!(api.info("after"), Err(LoggerError::LoggerStopped)));

    let content = fs::read_to_string(&log_file).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines, vec!["root starting", "api listening", "db connection lost"]);
}
