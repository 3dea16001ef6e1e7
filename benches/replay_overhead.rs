//! Replay Overhead Benchmarks
//!
//! Measures what the retry layer adds on the happy path and what a replay
//! costs:
//! - checksum folding per value kind
//! - FOR UPDATE rewriting
//! - a small transaction on a bare mock connection, through a recording
//!   connection, and through a recording connection whose commit aborts once

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use sqlreplay::{
    Checksum, Connection, Driver, DriverOptions, Error, QueryProcessor, ResultSetExt,
    SelectForUpdate, Value,
};
use sqlreplay_core::testing::{MockDatabase, Op};

const BALANCE: &str = "select balance from accounts where id = 1";
const DEBIT: &str = "update accounts set balance = balance - 10 where id = 1";

fn accounts() -> MockDatabase {
    let db = MockDatabase::new();
    db.set_rows(BALANCE, &["balance"], vec![vec![Value::Int(100)]]);
    db.set_update_count(DEBIT, 1);
    db
}

fn run_transaction(conn: &mut dyn Connection) {
    let mut stmt = conn.create_statement().unwrap();
    {
        let mut rs = stmt.execute_query(BALANCE).unwrap();
        rs.next().unwrap();
        black_box(rs.get_i64(1).unwrap());
    }
    stmt.execute_update(DEBIT).unwrap();
    conn.commit().unwrap();
}

/// Benchmark: folding values into the checksum
fn bench_checksum_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum_fold");
    let cases = [
        ("int", Value::Int(1_234_567)),
        ("float", Value::Float(1234.5678)),
        ("decimal", Value::Decimal("98765.4321".to_string())),
        ("text_32", Value::Text("x".repeat(32))),
        ("bytes_1k", Value::Bytes(vec![7u8; 1024])),
        ("null", Value::Null),
    ];

    group.throughput(Throughput::Elements(1));
    for (name, value) in cases.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), value, |b, value| {
            let mut checksum = Checksum::new();
            b.iter(|| checksum.fold(black_box(value)));
        });
    }
    group.finish();
}

/// Benchmark: row-locking rewrite
fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");
    let cases = [
        ("plain_select", "select * from accounts where id in (?, ?)"),
        ("terminated", "select * from accounts where id = 1;"),
        ("aggregate", "select count(*), sum(balance) from accounts"),
        ("already_locked", "select * from accounts for update"),
        ("update", DEBIT),
    ];

    for (name, sql) in cases.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), sql, |b, sql| {
            b.iter(|| black_box(SelectForUpdate.process(false, black_box(sql))));
        });
    }
    group.finish();
}

/// Benchmark: one read-then-write transaction
fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");
    group.throughput(Throughput::Elements(1));

    group.bench_function("bare", |b| {
        let db = accounts();
        let mut conn = db.connect().unwrap();
        b.iter(|| run_transaction(&mut conn));
    });

    group.bench_function("recording", |b| {
        let db = accounts();
        let options = DriverOptions::new().with_retry_transient_errors(true);
        let driver = Driver::new(db.factory(), options).unwrap();
        let mut conn = driver.connect().unwrap();
        b.iter(|| run_transaction(&mut conn));
    });

    group.bench_function("replayed_once", |b| {
        let db = accounts();
        let options = DriverOptions::new()
            .with_retry_transient_errors(true)
            .with_retry_max_backoff(Duration::ZERO)
            .with_retry_listener("none");
        let driver = Driver::new(db.factory(), options).unwrap();
        let mut conn = driver.connect().unwrap();
        b.iter(|| {
            db.fail_times(Op::Commit, 1, Error::serialization_failure("restart transaction"));
            run_transaction(&mut conn);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_checksum_fold, bench_rewrite, bench_transaction);
criterion_main!(benches);
