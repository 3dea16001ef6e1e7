//! Stress Tests
//!
//! Heavy retry workloads. All marked #[ignore] for opt-in execution.
//! Run with: cargo test --test retry stress -- --ignored

use crate::common::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

/// Many threads committing through one driver while commits keep aborting
#[test]
#[ignore]
fn stress_concurrent_transfers_with_aborts() {
    const THREADS: usize = 8;
    const TRANSFERS: usize = 50;
    const ABORTS: usize = 100;

    let bank = Bank::new(&[(1, 1_000_000), (2, 1_000_000)]);
    let driver = bank.driver(fast_options().with_retry_max_attempts(ABORTS as u32 + 1));
    bank.abort_commits(ABORTS);

    let barrier = Arc::new(Barrier::new(THREADS));
    let start = Instant::now();
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let driver = driver.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut conn = driver.connect().unwrap();
                conn.set_auto_commit(false).unwrap();
                barrier.wait();
                for _ in 0..TRANSFERS {
                    let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
                    transfer(&mut conn, from, to, 1).unwrap();
                    conn.commit().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    println!(
        "{} transfers with {} aborted commits in {:?}",
        THREADS * TRANSFERS,
        ABORTS,
        elapsed
    );
    assert_eq!(bank.db.calls(Op::Commit), THREADS * TRANSFERS + ABORTS);
    assert_eq!(bank.db.connections_opened(), THREADS + ABORTS);
}

/// Long transactions replayed many times
#[test]
#[ignore]
fn stress_long_transaction_replay() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options().with_retry_max_attempts(20));

    for _ in 0..500 {
        transfer(&mut conn, 1, 2, 0).unwrap();
    }
    bank.abort_commits(10);
    conn.commit().unwrap();

    assert_eq!(bank.journal().len(), 500 * 4 * 11);
}
