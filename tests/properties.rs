//! Property tests: the engine behaves like an ordered map across puts,
//! removes, commits, aborts, and reopens.

use std::collections::BTreeMap;

use proptest::prelude::*;
use tempfile::TempDir;
use vellum::{Config, Cursor, Database, OpenMode, Transaction, TransactionKind};

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u16),
    Remove(u8),
    Commit,
    Abort,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<u8>(), 0u16..2048).prop_map(|(k, len)| Op::Put(k % 32, len)),
        2 => any::<u8>().prop_map(|k| Op::Remove(k % 32)),
        1 => Just(Op::Commit),
        1 => Just(Op::Abort),
    ]
}

fn key_bytes(k: u8) -> Vec<u8> {
    format!("key-{k:02}").into_bytes()
}

fn value_bytes(k: u8, len: u16) -> Vec<u8> {
    vec![k ^ 0x5A; len as usize]
}

/// Drains the tree through a cursor into an ordered list.
fn dump(db: &Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let txn = db.begin_transaction(TransactionKind::ReadOnly).unwrap();
    let mut cursor = Cursor::new(&txn);
    let mut out = Vec::new();
    if !cursor.first().unwrap() {
        return out;
    }
    loop {
        let (k, v) = cursor.current().unwrap();
        out.push((k.to_vec(), v.to_vec()));
        if !cursor.next().unwrap() {
            break;
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, ..ProptestConfig::default() })]

    #[test]
    fn behaves_like_an_ordered_map(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prop.vlm");
        let config = Config { page_size: Some(4096), ..Config::default() };
        let db = Database::open_with_config(&path, OpenMode::ReadWrite, config).unwrap();

        let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut pending = committed.clone();
        let mut txn: Option<Transaction<'_>> = None;
        let mut tag = 0u64;

        for op in ops {
            match op {
                Op::Put(k, len) => {
                    let active = txn.get_or_insert_with(|| {
                        db.begin_transaction(TransactionKind::ReadWrite).unwrap()
                    });
                    active.put(&key_bytes(k), &value_bytes(k, len)).unwrap();
                    pending.insert(key_bytes(k), value_bytes(k, len));
                }
                Op::Remove(k) => {
                    let active = txn.get_or_insert_with(|| {
                        db.begin_transaction(TransactionKind::ReadWrite).unwrap()
                    });
                    active.remove(&key_bytes(k)).unwrap();
                    pending.remove(&key_bytes(k));
                }
                Op::Commit => {
                    if let Some(active) = txn.take() {
                        tag += 1;
                        active.commit(tag).unwrap();
                        committed = pending.clone();
                    }
                }
                Op::Abort => {
                    if let Some(active) = txn.take() {
                        active.abort();
                        pending = committed.clone();
                    }
                }
            }

            // A write transaction always observes its own effects.
            if let Some(active) = &txn {
                for (k, v) in &pending {
                    let got = active.get(k).unwrap();
                    prop_assert_eq!(got.as_ref(), Some(v));
                }
            }
        }

        if let Some(active) = txn.take() {
            tag += 1;
            active.commit(tag).unwrap();
            committed = pending.clone();
        }
        drop(txn);

        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            committed.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(dump(&db), expected.clone());

        let report = db.verify_integrity().unwrap();
        prop_assert!(report.is_ok(), "integrity errors: {:?}", report.errors);

        // Reopen and compare again: the committed state must be exactly
        // what the marker protocol recovers.
        db.close().unwrap();
        let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
        prop_assert_eq!(dump(&db), expected);
    }
}
