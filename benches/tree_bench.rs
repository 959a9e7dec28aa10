//! Storage engine benchmarks: point lookups, batched inserts, and forward
//! scans at a few dataset sizes.

#![allow(missing_docs)]

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use vellum::{Config, Cursor, Database, OpenMode, TransactionKind};

fn populate(db: &Database, count: usize, batch: usize) {
    for start in (0..count).step_by(batch) {
        let txn = db.begin_transaction(TransactionKind::ReadWrite).expect("write txn");
        for i in start..(start + batch).min(count) {
            let key = format!("key-{i:08}");
            let value = format!("value-{i}");
            txn.put(key.as_bytes(), value.as_bytes()).expect("put");
        }
        txn.commit(start as u64).expect("commit");
    }
    db.sync().expect("sync");
}

fn bench_db(dir: &TempDir, count: usize) -> Database {
    let config = Config { page_size: Some(4096), cache_size: 256, ..Config::default() };
    let db = Database::open_with_config(dir.path().join("bench.vlm"), OpenMode::ReadWrite, config)
        .expect("create database");
    populate(&db, count, 1000);
    db
}

fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000usize, 10_000, 50_000] {
        let dir = TempDir::new().expect("temp dir");
        let db = bench_db(&dir, count);

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % count;
                let key = format!("key-{i:08}");
                black_box(db.get(key.as_bytes()).expect("get"))
            });
        });
    }
    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/insert");
    group.throughput(Throughput::Elements(100));

    group.bench_function("batch_100", |b| {
        let dir = TempDir::new().expect("temp dir");
        let db = bench_db(&dir, 0);
        let mut next = 0usize;
        b.iter(|| {
            let txn = db.begin_transaction(TransactionKind::ReadWrite).expect("write txn");
            for _ in 0..100 {
                let key = format!("key-{next:08}");
                txn.put(key.as_bytes(), b"benchmark-value").expect("put");
                next += 1;
            }
            txn.commit(next as u64).expect("commit");
        });
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree/scan");
    let count = 10_000usize;
    group.throughput(Throughput::Elements(count as u64));

    let dir = TempDir::new().expect("temp dir");
    let db = bench_db(&dir, count);

    group.bench_function("forward_10k", |b| {
        b.iter(|| {
            let txn = db.begin_transaction(TransactionKind::ReadOnly).expect("read txn");
            let mut cursor = Cursor::new(&txn);
            let mut visited = 0usize;
            if cursor.first().expect("first") {
                loop {
                    visited += 1;
                    black_box(cursor.current());
                    if !cursor.next().expect("next") {
                        break;
                    }
                }
            }
            assert_eq!(visited, count);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_point_lookup, bench_insert, bench_scan);
criterion_main!(benches);
