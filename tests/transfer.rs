//! End-to-end transfers.
//!
//! Each test runs the full choreography on loopback: the relay binds an
//! OS-chosen port, the reader and writer connect to it, the driver moves the
//! file and everything is torn down before the files are compared.

use std::path::{Path, PathBuf};
use std::time::Duration;

use qrelay::endpoint::Role;
use qrelay::integrity::hasher;
use qrelay::{run_transfer, verify, Config, Error, IntegrityError, SendMode, StopReason, StopSignal};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Scratch {
    _dir: tempfile::TempDir,
    source: PathBuf,
    destination: PathBuf,
}

fn scratch(content: &[u8]) -> Scratch {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("message_to_send.txt");
    let destination = dir.path().join("message_received.txt");
    std::fs::write(&source, content).expect("write source");
    Scratch {
        _dir: dir,
        source,
        destination,
    }
}

fn config(files: &Scratch, mode: SendMode) -> Config {
    let mut config = Config::default();
    config.relay.port = 0;
    config.relay.accept_timeout_ms = 5000;
    config.transfer.source.clone_from(&files.source);
    config.transfer.destination.clone_from(&files.destination);
    config.transfer.mode = mode;
    config.transfer.io_timeout_ms = 200;
    config
}

async fn transfer(config: &Config) -> qrelay::Result<qrelay::TransferReport> {
    transfer_within(config, Duration::from_secs(30)).await
}

async fn transfer_within(
    config: &Config,
    limit: Duration,
) -> qrelay::Result<qrelay::TransferReport> {
    tokio::time::timeout(limit, run_transfer(config, StopSignal::new()))
        .await
        .expect("transfer hung")
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("read file")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Three short lines arrive byte-for-byte in line mode.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn line_mode_three_lines() {
    let files = scratch(b"a\nbb\nccc\n");
    let report = transfer(&config(&files, SendMode::Line)).await.unwrap();

    assert_eq!(read(&files.destination), b"a\nbb\nccc\n");
    assert_eq!(report.stop_reason, Some(StopReason::Exhausted));
    assert_eq!(report.bytes_sent, 9);
    assert_eq!(report.bytes_received, 9);
    assert_eq!(report.bytes_forwarded, 9);
    assert!(report.completed());

    let verdict = verify(&files.source, &files.destination).await.unwrap();
    assert_eq!(verdict.digest, hasher::hash_bytes(b"a\nbb\nccc\n"));
}

/// An empty source stops on the first send and leaves an empty destination.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_source_produces_empty_destination() {
    let files = scratch(b"");
    let report = transfer(&config(&files, SendMode::Line)).await.unwrap();

    assert_eq!(report.stop_reason, Some(StopReason::Exhausted));
    assert_eq!(report.bytes_sent, 0);
    assert_eq!(read(&files.destination), b"");
    assert_eq!(verify(&files.source, &files.destination).await.unwrap().size, 0);
}

/// Lines longer than the relay buffer, non-ASCII text and a missing final
/// newline all survive line mode.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn line_mode_long_and_multibyte_lines() {
    let mut content = Vec::new();
    content.extend_from_slice("é".repeat(700).as_bytes());
    content.push(b'\n');
    content.extend_from_slice(b"short\n");
    content.extend(std::iter::repeat(b'x').take(2000));
    content.push(b'\n');
    content.extend_from_slice("déjà vu, no trailing newline".as_bytes());

    let files = scratch(&content);
    let report = transfer(&config(&files, SendMode::Line)).await.unwrap();

    assert!(report.completed());
    assert_eq!(read(&files.destination), content);
    verify(&files.source, &files.destination).await.unwrap();
}

/// Burst mode sends the whole file as one unit, drained over many receives.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_mode_large_file() {
    let content: Vec<u8> = (0..64 * 1024)
        .map(|i| if i % 80 == 79 { b'\n' } else { b'a' + (i % 26) as u8 })
        .collect();
    let files = scratch(&content);
    let report = transfer(&config(&files, SendMode::Burst)).await.unwrap();

    assert!(report.completed());
    assert_eq!(report.bytes_received, content.len() as u64);
    verify(&files.source, &files.destination).await.unwrap();
}

/// A burst far larger than the loopback socket buffers is pushed in pieces
/// while the writer drains, instead of tripping the relay.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_mode_exceeds_socket_buffers() {
    let content: Vec<u8> = (0..16 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let files = scratch(&content);
    let mut config = config(&files, SendMode::Burst);
    config.relay.max_duration_ms = 120_000;

    let report = transfer_within(&config, Duration::from_secs(150)).await.unwrap();

    assert_eq!(report.stop_reason, Some(StopReason::Exhausted));
    assert!(report.completed());
    assert_eq!(report.bytes_received, content.len() as u64);
    let verdict = verify(&files.source, &files.destination).await.unwrap();
    assert_eq!(verdict.digest, hasher::hash_bytes(&content));
}

/// Old destination content is gone before the new data is appended.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_destination_is_replaced() {
    let files = scratch(b"new\n");
    std::fs::write(&files.destination, b"old content that is much longer than the new one\n")
        .unwrap();

    transfer(&config(&files, SendMode::Line)).await.unwrap();

    assert_eq!(read(&files.destination), b"new\n");
}

/// The relay ceiling ends a run whose reader is nowhere near exhausted, and
/// teardown still completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_ceiling_ends_unfinished_transfer() {
    let content = b"a\n".repeat(200_000);
    let files = scratch(&content);
    let mut config = config(&files, SendMode::Line);
    config.relay.max_duration_ms = 100;

    let report = transfer(&config).await.unwrap();

    assert_eq!(report.stop_reason, Some(StopReason::Ceiling));
    assert!(!report.completed());
    assert!(report.bytes_received < content.len() as u64);
    assert!(matches!(
        verify(&files.source, &files.destination).await,
        Err(IntegrityError::ContentMismatch { .. } | IntegrityError::SizeMismatch { .. })
    ));
}

/// A missing source fails before any data moves.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_source_is_not_a_file() {
    let files = scratch(b"");
    let mut config = config(&files, SendMode::Line);
    config.transfer.source = files.source.with_file_name("does_not_exist.txt");

    let err = transfer(&config).await.unwrap_err();
    assert!(matches!(err, Error::NotAFile(p) if p.ends_with("does_not_exist.txt")));
    assert!(!files.destination.exists());
}

/// A stop requested before the run starts ends it without moving data.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preset_stop_ends_run_early() {
    let files = scratch(b"never sent\n");
    let stop = StopSignal::new();
    stop.set(StopReason::Shutdown);

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        run_transfer(&config(&files, SendMode::Line), stop),
    )
    .await
    .expect("transfer hung");

    // Depending on timing the clients may or may not have connected before
    // the relay wound down; either way nothing is transferred.
    match result {
        Ok(report) => {
            assert_eq!(report.stop_reason, Some(StopReason::Shutdown));
            assert_eq!(report.bytes_sent, 0);
            assert_eq!(report.bytes_received, 0);
        }
        Err(e) => assert!(
            matches!(e, Error::ConnectFailed(Role::Reader | Role::Writer)),
            "unexpected error: {e}"
        ),
    }
    assert!(!files.destination.exists() || read(&files.destination).is_empty());
}
