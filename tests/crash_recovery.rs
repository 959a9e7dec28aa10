//! Crash recovery tests for the marker protocol.
//!
//! The durability design keeps four marker pages: two sync markers
//! (pages 1 and 2) written by `sync`, and two working markers (pages 3
//! and 4) alternated by commits. These tests corrupt marker slots in
//! every combination and verify that open falls back to the newest
//! recoverable state, and that commits which were never synced do not
//! survive a simulated crash.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use vellum::page::marker::MarkerPage;
use vellum::{Config, Database, OpenMode, TransactionKind};

const PAGE_SIZE: usize = 4096;

fn config() -> Config {
    Config { page_size: Some(PAGE_SIZE), ..Config::default() }
}

fn create_db(path: &Path) -> Database {
    Database::open_with_config(path, OpenMode::ReadWrite, config()).expect("create database")
}

/// Flips bytes inside a page's body so its checksum no longer verifies.
fn corrupt_page(path: &Path, pgno: u32) {
    let mut bytes = std::fs::read(path).unwrap();
    let offset = pgno as usize * PAGE_SIZE;
    for i in 24..64 {
        bytes[offset + i] ^= 0xFF;
    }
    std::fs::write(path, bytes).unwrap();
}

/// Reads a raw marker page, bypassing the engine.
fn read_marker_raw(path: &Path, pgno: u32) -> MarkerPage {
    let bytes = std::fs::read(path).unwrap();
    let offset = pgno as usize * PAGE_SIZE;
    MarkerPage::deserialize(&bytes[offset..offset + PAGE_SIZE]).unwrap()
}

/// Commits `count` entries, one commit each, tagged 1..=count.
fn commit_entries(db: &Database, count: u32) {
    for i in 1..=count {
        let txn = db.begin_transaction(TransactionKind::ReadWrite).unwrap();
        txn.put(i.to_string().as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        txn.commit(u64::from(i)).unwrap();
    }
}

fn assert_entries_present(db: &Database, count: u32) {
    for i in 1..=count {
        assert_eq!(
            db.get(i.to_string().as_bytes()).unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "entry {i} missing"
        );
    }
}

fn setup_synced_db(dir: &TempDir, commits: u32) -> PathBuf {
    let path = dir.path().join("crash.vlm");
    let db = create_db(&path);
    commit_entries(&db, commits);
    db.close().unwrap(); // close syncs by default
    path
}

#[test]
fn corrupt_sync_marker_a_falls_back_to_b() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 7);

    for _ in 0..3 {
        corrupt_page(&path, 1);
        let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
        assert_entries_present(&db, 7);
        assert_eq!(db.tag(), 7);
        db.close().unwrap();
    }
}

#[test]
fn corrupt_both_sync_markers_falls_back_to_working_markers() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 13);

    for _ in 0..3 {
        corrupt_page(&path, 1);
        corrupt_page(&path, 2);
        let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
        assert_entries_present(&db, 13);
        assert_eq!(db.tag(), 13);
        db.close().unwrap();
    }
}

#[test]
fn corrupt_working_markers_degrades_to_synced_state() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 9);

    corrupt_page(&path, 3);
    corrupt_page(&path, 4);

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    // Close synced everything, so the sync markers carry the full state.
    assert_entries_present(&db, 9);
    assert_eq!(db.tag(), 9);
}

#[test]
fn corrupt_every_marker_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 3);

    for pgno in 1..=4 {
        corrupt_page(&path, pgno);
    }
    assert!(Database::open(&path, OpenMode::ReadWrite).is_err());
}

#[test]
fn unsynced_commit_is_lost_on_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");

    {
        let no_sync_close = Config { sync_on_close: false, ..config() };
        let db = Database::open_with_config(&path, OpenMode::ReadWrite, no_sync_close).unwrap();

        let txn = db.begin_transaction(TransactionKind::ReadWrite).unwrap();
        txn.put(b"synced", b"yes").unwrap();
        txn.commit(1).unwrap();
        db.sync().unwrap();

        let txn = db.begin_transaction(TransactionKind::ReadWrite).unwrap();
        txn.put(b"unsynced", b"lost").unwrap();
        txn.commit(2).unwrap();
        // Crash: drop without sync. The working marker for commit 2 is on
        // disk but references an epoch that was never made durable.
    }

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    assert_eq!(db.get(b"synced").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.get(b"unsynced").unwrap(), None, "unsynced commit must not survive");
    assert_eq!(db.tag(), 1);

    // The recovered database accepts new writes.
    db.put(b"after", b"recovery").unwrap();
    assert_eq!(db.get(b"after").unwrap(), Some(b"recovery".to_vec()));
}

#[test]
fn synced_working_markers_are_trusted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");

    {
        let no_sync_close = Config { sync_on_close: false, ..config() };
        let db = Database::open_with_config(&path, OpenMode::ReadWrite, no_sync_close).unwrap();
        commit_entries(&db, 4);
        db.sync().unwrap();
        // Crash after the sync: ping/pong are from the durable epoch.
    }

    corrupt_page(&path, 1);
    corrupt_page(&path, 2);

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    assert_entries_present(&db, 4);
    assert_eq!(db.tag(), 4);
}

#[test]
fn commits_alternate_ping_and_pong() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");
    {
        let no_sync_close = Config { sync_on_close: false, ..config() };
        let db = Database::open_with_config(&path, OpenMode::ReadWrite, no_sync_close).unwrap();
        commit_entries(&db, 5);
    }

    // Revision 5 (odd) lands in pong, revision 4 in ping.
    let ping = read_marker_raw(&path, 3);
    let pong = read_marker_raw(&path, 4);
    assert_eq!(ping.meta.revision, 4);
    assert_eq!(pong.meta.revision, 5);
    assert_eq!(pong.meta.tag, 5);
}

#[test]
fn sync_promotes_working_marker_to_both_sync_slots() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");
    {
        let no_sync_close = Config { sync_on_close: false, ..config() };
        let db = Database::open_with_config(&path, OpenMode::ReadWrite, no_sync_close).unwrap();
        commit_entries(&db, 3);
        db.sync().unwrap();
    }

    let sync_a = read_marker_raw(&path, 1);
    let sync_b = read_marker_raw(&path, 2);
    assert_eq!(sync_a.meta.revision, 3);
    assert_eq!(sync_b.meta.revision, 3);
    assert_eq!(sync_a.meta.tag, 3);
    assert_eq!(sync_a.meta.sync_id, sync_b.meta.sync_id);
}

#[test]
fn sync_issues_two_fsyncs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");
    let no_sync_close = Config { sync_on_close: false, ..config() };
    let db = Database::open_with_config(&path, OpenMode::ReadWrite, no_sync_close).unwrap();

    let txn = db.begin_transaction(TransactionKind::ReadWrite).unwrap();
    txn.put(b"k", b"v").unwrap();
    txn.commit(1).unwrap();

    let before = db.stats().fsyncs;
    db.sync().unwrap();
    let after = db.stats().fsyncs;
    assert!(after >= before + 2, "sync must fsync at least twice (got {})", after - before);

    // A redundant sync does nothing.
    db.sync().unwrap();
    assert_eq!(db.stats().fsyncs, after);
}

#[test]
fn version_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 1);

    // Rewrite the version word with a matching checksum so the failure is
    // a version error, not a checksum error.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[16..20].copy_from_slice(&0x0BAD_CAFEu32.to_le_bytes());
    let checksum = vellum::page::page_checksum(&bytes[..PAGE_SIZE]).unwrap();
    bytes[0..4].copy_from_slice(&checksum.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    match Database::open(&path, OpenMode::ReadWrite) {
        Err(vellum::Error::Version { version }) => assert_eq!(version, 0x0BAD_CAFE),
        other => panic!("expected version error, got {:?}", other.err()),
    }
}

#[test]
fn corrupt_spec_page_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 1);

    corrupt_page(&path, 0);
    assert!(Database::open(&path, OpenMode::ReadWrite).is_err());
}

#[test]
fn file_size_is_page_aligned() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");
    let db = create_db(&path);

    commit_entries(&db, 20);
    db.sync().unwrap();
    let size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size % PAGE_SIZE as u64, 0);
    assert_eq!(db.size() % PAGE_SIZE as u64, 0);
}

#[test]
fn reopen_truncates_to_marker_size() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 5);

    // Append garbage beyond the recorded size.
    let recorded = std::fs::metadata(&path).unwrap().len();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&vec![0xEE; 3 * PAGE_SIZE]);
    std::fs::write(&path, bytes).unwrap();

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    assert_entries_present(&db, 5);
    drop(db);

    let after = std::fs::metadata(&path).unwrap().len();
    assert_eq!(after, recorded, "open must truncate to the marker's recorded size");
}

#[test]
fn read_only_open_sees_synced_state() {
    let dir = TempDir::new().unwrap();
    let path = setup_synced_db(&dir, 6);

    let db = Database::open(&path, OpenMode::ReadOnly).unwrap();
    assert_entries_present(&db, 6);

    // Writes are refused wholesale.
    assert!(db.begin_transaction(TransactionKind::ReadWrite).is_err());
}

#[test]
fn recovery_loops_survive_repeated_crashes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.vlm");

    {
        let db = create_db(&path);
        commit_entries(&db, 2);
        db.close().unwrap();
    }

    // Crash/corrupt/reopen cycles with growing data; every reopened state
    // must contain everything synced before the crash.
    for round in 0u32..4 {
        corrupt_page(&path, 1 + (round % 2));
        let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
        assert_entries_present(&db, 2 + round * 3);

        let txn = db.begin_transaction(TransactionKind::ReadWrite).unwrap();
        for i in 0..3u32 {
            let n = 2 + round * 3 + i + 1;
            txn.put(n.to_string().as_bytes(), format!("value-{n}").as_bytes()).unwrap();
        }
        txn.commit(u64::from(round) + 100).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    assert_entries_present(&db, 14);
    let report = db.verify_integrity().unwrap();
    assert!(report.is_ok(), "integrity errors: {:?}", report.errors);
}
