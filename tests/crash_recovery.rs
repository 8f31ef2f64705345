//! Integration test: durability and crash recovery semantics.
//!
//! Validates that:
//! - Flushed fragments survive engine drop + reopen via the snapshot
//! - Unflushed writes survive a crash via write-ahead log replay
//! - A torn log tail (partial final record) is tolerated, earlier
//!   records still replay
//! - A corrupt snapshot is rejected at open time, not silently loaded
//!
//! "Crash" here means the process dies without running destructors:
//! simulated with `mem::forget`, which leaks the engine so neither the
//! log truncation nor the drop-time flush runs.

use std::sync::Arc;

use bitgrid::stats::NoopStats;
use bitgrid::wire::WriteOp;
use bitgrid::{Config, Engine, FragmentKey};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_engine(dir: &TempDir) -> Engine {
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    Engine::open(&config, Arc::new(NoopStats)).unwrap()
}

fn set_bits(engine: &Engine, row: u64, cols: &[u64]) {
    for &col in cols {
        engine.write("docs", "tags", row, col, WriteOp::Set).unwrap();
    }
}

fn read_cols(engine: &Engine, row: u64) -> Vec<u64> {
    engine.read("docs", "tags", row).iter_cols().collect()
}

fn wal_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("docs").join("tags").join("0.wal")
}

fn snapshot_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("docs").join("tags").join("0.snap")
}

// ---------------------------------------------------------------------------
// Tests: Clean restart
// ---------------------------------------------------------------------------

#[test]
fn flushed_bits_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open_engine(&dir);
        set_bits(&engine, 5, &[1, 2, 3]);
        set_bits(&engine, 9, &[100_000]);
        engine.flush_all().unwrap();
    }

    let engine = open_engine(&dir);
    assert_eq!(read_cols(&engine, 5), vec![1, 2, 3]);
    assert_eq!(read_cols(&engine, 9), vec![100_000]);
}

#[test]
fn flush_truncates_log() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    set_bits(&engine, 1, &[10, 20]);
    assert!(wal_path(&dir).metadata().unwrap().len() > 0);

    engine.flush_all().unwrap();
    assert_eq!(wal_path(&dir).metadata().unwrap().len(), 0);
    assert!(snapshot_path(&dir).exists());
}

#[test]
fn digest_stable_across_reopen() {
    let dir = TempDir::new().unwrap();
    let before = {
        let engine = open_engine(&dir);
        set_bits(&engine, 3, &[7, 8, 70_000]);
        engine.flush_all().unwrap();
        engine.digest(&FragmentKey::new("docs", "tags", 0)).unwrap()
    };

    let engine = open_engine(&dir);
    let after = engine.digest(&FragmentKey::new("docs", "tags", 0)).unwrap();
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// Tests: Crash (no destructors)
// ---------------------------------------------------------------------------

#[test]
fn unflushed_writes_replayed_from_log() {
    let dir = TempDir::new().unwrap();

    let engine = open_engine(&dir);
    set_bits(&engine, 5, &[1, 2, 3]);
    // No flush: bits exist only in memory and the log.
    std::mem::forget(engine);

    let engine = open_engine(&dir);
    assert_eq!(read_cols(&engine, 5), vec![1, 2, 3]);
}

#[test]
fn replay_applies_on_top_of_snapshot() {
    let dir = TempDir::new().unwrap();

    let engine = open_engine(&dir);
    set_bits(&engine, 5, &[1, 2]);
    engine.flush_all().unwrap();
    set_bits(&engine, 5, &[3]);
    engine.write("docs", "tags", 5, 1, WriteOp::Clear).unwrap();
    std::mem::forget(engine);

    // Snapshot has {1,2}; log has +3, -1.
    let engine = open_engine(&dir);
    assert_eq!(read_cols(&engine, 5), vec![2, 3]);
}

#[test]
fn torn_log_tail_tolerated() {
    use std::io::Write;

    let dir = TempDir::new().unwrap();

    let engine = open_engine(&dir);
    set_bits(&engine, 5, &[1, 2]);
    std::mem::forget(engine);

    // Simulate a crash mid-append: a length prefix promising more bytes
    // than were written.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(wal_path(&dir))
        .unwrap();
    file.write_all(&200u32.to_le_bytes()).unwrap();
    file.write_all(&[0xAB; 10]).unwrap();
    drop(file);

    let engine = open_engine(&dir);
    assert_eq!(read_cols(&engine, 5), vec![1, 2]);
}

#[test]
fn corrupt_snapshot_rejected_at_open() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open_engine(&dir);
        set_bits(&engine, 5, &[1, 2, 3]);
        engine.flush_all().unwrap();
    }

    // Flip a payload byte past the header.
    let path = snapshot_path(&dir);
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() - 8;
    bytes[mid] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let err = Engine::open(&config, Arc::new(NoopStats)).unwrap_err();
    assert!(
        matches!(err, bitgrid::GridError::Corrupt(_)),
        "expected Corrupt, got {err:?}"
    );
}
