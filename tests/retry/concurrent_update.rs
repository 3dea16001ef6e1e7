//! Replays that read different data than the original transaction

use crate::common::*;

#[test]
fn test_changed_balance_aborts_transfer() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());
    transfer(&mut conn, 1, 2, 10).unwrap();

    bank.set_balance(1, 90);
    bank.abort_commits(1);
    let err = conn.commit().unwrap_err();

    assert!(matches!(err, Error::ConcurrentUpdate));
    assert_eq!(err.sql_state(), Some("40001"));
    assert!(!err.is_serialization_failure());
    // no second attempt after a mismatch
    assert_eq!(bank.db.connections_opened(), 2);
}

#[test]
fn test_changes_to_unread_rows_are_tolerated() {
    let bank = Bank::new(&[(1, 100), (2, 50), (3, 0)]);
    let mut conn = bank.connect(fast_options());
    transfer(&mut conn, 1, 2, 10).unwrap();

    bank.set_balance(3, 1_000);
    bank.abort_commits(1);
    conn.commit().unwrap();
}

#[test]
fn test_listener_sees_the_mismatch() {
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

    bank.set_balance(2, 49);
    bank.abort_commits(1);
    assert!(conn.commit().is_err());

    assert_eq!(
        *listener.events.lock(),
        vec!["before commit 1", "after commit 1 failed 40001"]
    );
}

#[test]
fn test_mismatch_during_statement_retry() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());
    let mut stmt = conn.create_statement().unwrap();
    assert_eq!(read_balance(stmt.as_mut(), 1).unwrap(), 100);

    bank.set_balance(1, 80);
    bank.db.fail_times(
        Op::ExecuteUpdate,
        1,
        Error::serialization_failure("restart transaction"),
    );
    let err = stmt.execute_update(&adjust_sql(1, -10)).unwrap_err();
    assert!(matches!(err, Error::ConcurrentUpdate));
}

#[test]
fn test_connection_recovers_after_rollback() {
    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(fast_options());
    transfer(&mut conn, 1, 2, 10).unwrap();

    bank.set_balance(1, 90);
    bank.abort_commits(1);
    assert!(conn.commit().is_err());

    conn.rollback().unwrap();
    assert_eq!(transfer(&mut conn, 1, 2, 10).unwrap(), (90, 50));
    conn.commit().unwrap();
}

// ============================================================================
// Row shape changes that keep the same concatenated text
// ============================================================================

const PAIR_SQL: &str = "select a, b from pairs where id = 1";

fn set_pair(bank: &Bank, a: Value, b: Value) {
    bank.db.set_rows(PAIR_SQL, &["a", "b"], vec![vec![a, b]]);
}

fn read_pair_as_text(conn: &mut RetryConnection) -> (Option<String>, Option<String>) {
    let mut stmt = conn.create_statement().unwrap();
    let mut rs = stmt.execute_query(PAIR_SQL).unwrap();
    assert!(rs.next().unwrap());
    (rs.get_string(1).unwrap(), rs.get_string(2).unwrap())
}

fn read_pair_as_int(conn: &mut RetryConnection) -> (Option<i64>, Option<i64>) {
    let mut stmt = conn.create_statement().unwrap();
    let mut rs = stmt.execute_query(PAIR_SQL).unwrap();
    assert!(rs.next().unwrap());
    (rs.get_i64(1).unwrap(), rs.get_i64(2).unwrap())
}

#[test]
fn test_shifted_digits_are_a_concurrent_update() {
    let bank = Bank::new(&[]);
    set_pair(&bank, Value::Int(1), Value::Int(100));
    let mut conn = bank.connect(fast_options());
    assert_eq!(read_pair_as_int(&mut conn), (Some(1), Some(100)));

    set_pair(&bank, Value::Int(110), Value::Int(0));
    bank.abort_commits(1);
    assert!(matches!(conn.commit(), Err(Error::ConcurrentUpdate)));
}

#[test]
fn test_moved_null_is_a_concurrent_update() {
    let bank = Bank::new(&[]);
    set_pair(&bank, Value::Null, Value::from("x"));
    let mut conn = bank.connect(fast_options());
    assert_eq!(read_pair_as_text(&mut conn), (None, Some("x".to_string())));

    set_pair(&bank, Value::from("x"), Value::Null);
    bank.abort_commits(1);
    assert!(matches!(conn.commit(), Err(Error::ConcurrentUpdate)));
}

#[test]
fn test_identical_pair_with_null_replays() {
    let bank = Bank::new(&[]);
    set_pair(&bank, Value::Null, Value::from("x"));
    let mut conn = bank.connect(fast_options());
    read_pair_as_text(&mut conn);

    bank.abort_commits(1);
    conn.commit().unwrap();
}
