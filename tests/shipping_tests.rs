//! Log shipping tests
//!
//! A client logger in one registry ships entries over TCP to a server
//! logger in another registry, standing in for two processes.

use logpipe::prelude::*;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(10);

fn domain_and_message() -> LogConfig {
    LogConfig::builder()
        .formatter(|entry| format!("{} {}", entry.domain, entry.message))
        .build()
        .unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn file_contains(path: &Path, needle: &str) -> bool {
    fs::read_to_string(path)
        .map(|content| content.lines().any(|line| line == needle))
        .unwrap_or(false)
}

fn collector(registry: &LogRegistry, path: &Path, bind: &str) -> (Logger, SocketAddr) {
    let logger = registry
        .get_logger(LoggerOptions::new("collector").path(path).server(bind))
        .unwrap();
    let addr = logger.server_addr().expect("server not bound");
    (logger, addr)
}

/// Run `task` on its own thread and fail if it outlives the deadline
fn within_deadline<T: Send + 'static>(task: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(task());
    });
    rx.recv_timeout(DEADLINE).expect("operation did not return in time")
}

/// Keep `logger` shipping until `running` is cleared
fn keep_sending(logger: Logger, running: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut i = 0u64;
        while running.load(Ordering::SeqCst) {
            let _ = logger.info(format!("tick {}", i));
            i += 1;
            thread::sleep(Duration::from_millis(1));
        }
    })
}

fn has_line_starting(path: &Path, prefix: &str) -> bool {
    fs::read_to_string(path)
        .map(|content| content.lines().any(|line| line.starts_with(prefix)))
        .unwrap_or(false)
}

#[test]
fn test_shipped_entries_land_in_server_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server_file = temp_dir.path().join("server.log");
    let client_file = temp_dir.path().join("client.log");

    let server = LogRegistry::new(domain_and_message());
    let (_collector, addr) = collector(&server, &server_file, "127.0.0.1:0");

    let client = LogRegistry::new(domain_and_message());
    let edge = client
        .get_logger(
            LoggerOptions::new("edge")
                .path(&client_file)
                .connect(addr.to_string()),
        )
        .unwrap();

    edge.warning("disk almost full").unwrap();
    edge.info("request served").unwrap();

    assert!(wait_for(|| file_contains(&server_file, "edge request served")));
    assert!(file_contains(&server_file, "edge disk almost full"));
    assert!(file_contains(&client_file, "edge request served"));

    // The receiving side created the shipped domain on demand
    let injected = server.logger("edge").expect("domain not created");
    assert_eq!(injected.level(), LogLevel::NotSet);
    assert!(injected.shares_file_with(&server.logger("collector").unwrap()));
    assert_eq!(server.open_handles(&server_file), 1);

    let metrics = edge.shipping_metrics().expect("not a shipping logger");
    assert!(wait_for(|| metrics.shipped() == 2));
    assert_eq!(metrics.dropped(), 0);

    client.shutdown_all(false);
    server.shutdown_all(false);
}

#[test]
fn test_shipped_entry_keeps_all_fields() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server_file = temp_dir.path().join("server.log");

    let server = LogRegistry::new(domain_and_message());
    server.set_backlog_size(16);
    let (_collector, addr) = collector(&server, &server_file, "127.0.0.1:0");

    let client = LogRegistry::new(domain_and_message());
    client.set_backlog_size(16);
    let worker = client
        .get_logger(LoggerOptions::new("worker").connect(addr.to_string()))
        .unwrap();
    worker
        .error_with(
            "job failed",
            Attributes::new()
                .with("job_id", 17)
                .with("queue", "emails")
                .with("retryable", false)
                .with("elapsed", 1.5),
        )
        .unwrap();

    let sent = client
        .backlog()
        .into_iter()
        .find_map(|item| match item {
            BacklogItem::Entry(entry) => Some(entry),
            BacklogItem::Error(_) => None,
        })
        .expect("entry not recorded on client");

    let mut received = None;
    assert!(wait_for(|| {
        received = server.backlog().into_iter().find_map(|item| match item {
            BacklogItem::Entry(entry) if entry.domain == "worker" => Some(entry),
            _ => None,
        });
        received.is_some()
    }));
    let received = received.unwrap();

    assert_eq!(received.domain, sent.domain);
    assert_eq!(received.level, LogLevel::Error);
    assert_eq!(received.message, sent.message);
    assert_eq!(received.attrs, sent.attrs);
    assert!((received.time - sent.time).abs() < 1e-6);

    client.shutdown_all(false);
    server.shutdown_all(false);
}

#[test]
fn test_existing_domain_applies_its_threshold() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server_file = temp_dir.path().join("server.log");
    let audit_file = temp_dir.path().join("audit.log");

    let server = LogRegistry::new(domain_and_message());
    let (_collector, addr) = collector(&server, &server_file, "127.0.0.1:0");
    let _audit = server
        .get_logger(
            LoggerOptions::new("audit")
                .path(&audit_file)
                .level(LogLevel::Warning),
        )
        .unwrap();

    let client = LogRegistry::new(domain_and_message());
    let audit = client
        .get_logger(
            LoggerOptions::new("audit")
                .level(LogLevel::Debug)
                .connect(addr.to_string()),
        )
        .unwrap();
    audit.info("routine check").unwrap();
    audit.error("permission denied").unwrap();

    assert!(wait_for(|| file_contains(&audit_file, "audit permission denied")));
    assert!(!file_contains(&audit_file, "audit routine check"));
    assert!(!file_contains(&server_file, "audit permission denied"));

    client.shutdown_all(false);
    server.shutdown_all(false);
}

#[test]
fn test_client_reconnects_when_server_appears() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server_file = temp_dir.path().join("late.log");

    // Reserve a free port, then release it for the late server
    let addr = {
        let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap()
    };

    let client = LogRegistry::new(domain_and_message());
    let early = client
        .get_logger(
            LoggerOptions::new("early")
                .connect(addr.to_string())
                .client_config(
                    ClientConfig::default()
                        .with_backoff(Duration::from_millis(10), Duration::from_millis(100)),
                ),
        )
        .unwrap();
    early.info("sent before the server was up").unwrap();

    let metrics = early.shipping_metrics().unwrap();
    assert!(wait_for(|| metrics.connection_failures() > 0));

    let server = LogRegistry::new(domain_and_message());
    let (_collector, bound) = collector(&server, &server_file, &addr.to_string());
    assert_eq!(bound, addr);

    assert!(wait_for(|| file_contains(
        &server_file,
        "early sent before the server was up"
    )));

    client.shutdown_all(false);
    server.shutdown_all(false);
}

#[test]
fn test_server_bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let server = LogRegistry::new(LogConfig::default());
    let result = server.get_logger(LoggerOptions::new("collector").server(addr));
    assert!(result.is_err());
    assert!(server.logger("collector").is_none());
}

#[test]
fn test_replacing_server_domain_while_client_ships() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server_file = temp_dir.path().join("server.log");
    let replacement_file = temp_dir.path().join("replacement.log");
    let relay_file = temp_dir.path().join("relay.log");
    let fast_retry = ClientConfig::default()
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100));

    let server = Arc::new(LogRegistry::new(domain_and_message()));
    let (old_collector, addr) = collector(&server, &server_file, "127.0.0.1:0");

    let client = LogRegistry::new(domain_and_message());
    let edge = client
        .get_logger(
            LoggerOptions::new("edge")
                .connect(addr.to_string())
                .client_config(fast_retry.clone()),
        )
        .unwrap();
    let running = Arc::new(AtomicBool::new(true));
    let sender = keep_sending(edge, Arc::clone(&running));
    assert!(wait_for(|| has_line_starting(&server_file, "edge tick ")));

    // Re-initializing the domain tears down its server under live traffic
    let registry = Arc::clone(&server);
    let replacement = within_deadline(move || {
        registry.get_logger(LoggerOptions::new("collector").path(&replacement_file))
    })
    .unwrap();
    assert!(old_collector.is_stopped());
    assert!(replacement.server_addr().is_none());
    assert!(!replacement.shares_file_with(&old_collector));
    assert!(!server.logger("collector").unwrap().is_stopped());

    // Shutting down a serving domain while a client is connected
    let relay_registry = LogRegistry::new(domain_and_message());
    let (relay, relay_addr) = collector(&relay_registry, &relay_file, "127.0.0.1:0");
    let forwarder = client
        .get_logger(
            LoggerOptions::new("forwarder")
                .connect(relay_addr.to_string())
                .client_config(fast_retry),
        )
        .unwrap();
    let forwarding = keep_sending(forwarder, Arc::clone(&running));
    assert!(wait_for(|| has_line_starting(&relay_file, "forwarder tick ")));

    let stopping = relay.clone();
    within_deadline(move || stopping.shutdown(false)).unwrap();
    assert!(relay.is_stopped());
    assert!(relay_registry.logger("collector").is_none());

    running.store(false, Ordering::SeqCst);
    sender.join().expect("sender panicked");
    forwarding.join().expect("sender panicked");
    client.shutdown_all(false);
    server.shutdown_all(false);
    relay_registry.shutdown_all(false);
}
