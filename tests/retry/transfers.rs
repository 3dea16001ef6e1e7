//! Transfers that succeed despite aborted transactions

use crate::common::*;
use std::sync::Arc;

#[test]
fn test_transfer_survives_aborted_commit() {
    init_tracing();
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());

    assert_eq!(transfer(&mut conn, 1, 2, 10).unwrap(), (100, 50));
    bank.abort_commits(1);
    conn.commit().unwrap();

    let once = vec![
        balance_sql(1),
        balance_sql(2),
        adjust_sql(1, -10),
        adjust_sql(2, 10),
    ];
    assert_eq!(bank.journal(), [once.clone(), once].concat());
    assert_eq!(bank.db.connections_opened(), 2);
}

#[test]
fn test_listener_sees_each_commit_retry() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let (listener, handle) = RecordingListener::shared();
    let driver = Driver::builder(bank.db.factory())
        .options(fast_options())
        .retry_listener(handle)
        .build()
        .unwrap();
    let mut conn = driver.connect().unwrap();
    conn.set_auto_commit(false).unwrap();

    transfer(&mut conn, 1, 2, 10).unwrap();
    bank.abort_commits(2);
    conn.commit().unwrap();

    assert_eq!(
        *listener.events.lock(),
        vec![
            "before commit 1",
            "after commit 1 ok",
            "before commit 2",
            "after commit 2 ok",
        ]
    );
}

#[test]
fn test_failed_update_is_retried_in_place() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());

    bank.db.fail_times(
        Op::ExecuteUpdate,
        1,
        Error::serialization_failure("restart transaction"),
    );
    assert_eq!(transfer(&mut conn, 1, 2, 10).unwrap(), (100, 50));
    conn.commit().unwrap();

    assert_eq!(bank.db.calls(Op::ExecuteUpdate), 3);
    assert_eq!(
        bank.journal(),
        vec![
            balance_sql(1),
            balance_sql(2),
            balance_sql(1),
            balance_sql(2),
            adjust_sql(1, -10),
            adjust_sql(2, 10),
        ]
    );
}

#[test]
fn test_prepared_transfer_replays_bindings() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());
    let adjust = "update accounts set balance = balance + ? where id = ?";

    let mut stmt = conn.prepare_statement(adjust).unwrap();
    for (id, delta) in [(1, -10), (2, 10)] {
        stmt.set_parameter(1, Value::Int(delta)).unwrap();
        stmt.set_parameter(2, Value::Int(id)).unwrap();
        assert_eq!(stmt.execute_update().unwrap(), 0);
    }
    bank.abort_commits(1);
    conn.commit().unwrap();

    assert_eq!(bank.db.calls(Op::Prepare), 2);
    assert_eq!(bank.journal(), vec![adjust; 4]);
    let bound = vec![
        vec![Value::Int(-10), Value::Int(1)],
        vec![Value::Int(10), Value::Int(2)],
    ];
    assert_eq!(bank.db.executed_bindings(), [bound.clone(), bound].concat());
}

#[test]
fn test_bindings_from_an_earlier_transaction_are_replayed() {
    let bank = Bank::new(&[(1, 100)]);
    let mut conn = bank.connect(fast_options());
    let adjust = "update accounts set balance = balance + ? where id = ?";

    let mut stmt = conn.prepare_statement(adjust).unwrap();
    stmt.set_parameter(1, Value::Int(-10)).unwrap();
    stmt.set_parameter(2, Value::Int(1)).unwrap();
    stmt.execute_update().unwrap();
    conn.commit().unwrap();

    // second transaction reuses the bindings of the first
    stmt.execute_update().unwrap();
    bank.abort_commits(1);
    conn.commit().unwrap();

    assert_eq!(bank.db.calls(Op::Prepare), 2);
    assert_eq!(
        bank.db.executed_bindings(),
        vec![vec![Value::Int(-10), Value::Int(1)]; 3]
    );
}

#[test]
fn test_only_the_current_transaction_replays() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());

    transfer(&mut conn, 1, 2, 10).unwrap();
    conn.commit().unwrap();
    transfer(&mut conn, 2, 1, 5).unwrap();
    bank.abort_commits(1);
    conn.commit().unwrap();

    let journal = bank.journal();
    assert_eq!(journal.len(), 12);
    assert_eq!(journal[4..8], journal[8..12]);
    assert_eq!(journal[8], balance_sql(2));
}

#[test]
fn test_rolled_back_work_is_not_replayed() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());

    transfer(&mut conn, 1, 2, 1_000).unwrap();
    conn.rollback().unwrap();
    transfer(&mut conn, 1, 2, 10).unwrap();
    bank.abort_commits(1);
    conn.commit().unwrap();

    let journal = bank.journal();
    assert_eq!(journal.len(), 12);
    assert!(!journal[8..].contains(&adjust_sql(1, -1_000)));
}

#[test]
fn test_logging_listener_counts_across_connections() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let listener = Arc::new(sqlreplay::LoggingRetryListener::new(5));
    let driver = Driver::builder(bank.db.factory())
        .options(fast_options())
        .retry_listener(listener.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        let mut conn = driver.connect().unwrap();
        conn.set_auto_commit(false).unwrap();
        transfer(&mut conn, 1, 2, 10).unwrap();
        bank.abort_commits(1);
        conn.commit().unwrap();
    }

    assert_eq!(listener.total_successful_retries(), 3);
    assert_eq!(listener.total_failed_retries(), 0);
}
