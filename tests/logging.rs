//! The process-wide logger: level gating and per-operation records.
//!
//! Installing a logger is one-way, so everything runs in a single test.

use std::sync::atomic::{AtomicUsize, Ordering};

use uring_file::logging::{self, LogLevel};
use uring_file::{
    ConfigBuilder, DriverKind, EventLoop, File, LoggingConfig, OpKind, OpenOptions, OwnedBuffer,
};

static FORMATTED: AtomicUsize = AtomicUsize::new(0);

fn counted() -> &'static str {
    FORMATTED.fetch_add(1, Ordering::SeqCst);
    "counted"
}

#[test]
fn operations_are_logged_with_correlation_ids_and_timed() {
    // Nothing installed: arguments are never evaluated.
    assert!(!logging::enabled(LogLevel::Error));
    uring_file::log_error!("test", "{}", counted());
    assert_eq!(FORMATTED.load(Ordering::SeqCst), 0);
    assert!(logging::latency().is_none());

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("engine.log");
    let config = ConfigBuilder::new()
        .driver(DriverKind::Blocking)
        .logging(LoggingConfig {
            enabled: true,
            level: LogLevel::Trace,
            log_file: Some(log_path.clone()),
            json_format: true,
        })
        .build()
        .unwrap();
    let event_loop = EventLoop::spawn(config).unwrap();
    assert!(logging::enabled(LogLevel::Trace));

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    let file = File::open(&event_loop.handle(), dir.path().join("data.bin"), &options)
        .join()
        .unwrap();
    let data = OwnedBuffer::from_slice(b"logged");
    assert_eq!(file.write(&data, 0, false).join().unwrap(), 6);
    let back = OwnedBuffer::new(6);
    assert_eq!(file.read(&back, 0).join().unwrap(), 6);
    file.close().join().unwrap();
    event_loop.shutdown();

    let latency = logging::latency().unwrap();
    assert_eq!(latency.get(OpKind::Write).unwrap().count, 1);
    assert_eq!(latency.get(OpKind::Read).unwrap().count, 1);
    assert!(latency.get(OpKind::OpenAt).is_some());

    let log = std::fs::read_to_string(&log_path).unwrap();
    let write_records: Vec<&str> = log
        .lines()
        .filter(|line| line.contains("\"op\":\"write\""))
        .collect();
    // One on submission, one on completion, both tied to the same operation.
    assert_eq!(write_records.len(), 2);
    for record in &write_records {
        assert!(record.contains("\"correlation_id\":"));
        assert!(record.contains("\"fd\":"));
    }
    assert!(write_records[1].contains("\"elapsed_us\":"));

    logging::set_level(LogLevel::Info);
    uring_file::log_debug!("test", "{}", counted());
    assert_eq!(FORMATTED.load(Ordering::SeqCst), 0);
    uring_file::log_warn!("test", "{}", counted());
    assert_eq!(FORMATTED.load(Ordering::SeqCst), 1);
}
