//! Implicit row locking through the driver

use crate::common::*;

fn locked(sql: &str) -> String {
    format!("{} FOR UPDATE", sql)
}

#[test]
fn test_toggle_is_replayed_with_locking() {
    let bank = Bank::new(&[(1, 100)]);
    let mut conn = bank.connect(fast_options());
    let mut stmt = conn.create_statement().unwrap();

    assert!(stmt.execute("SET implicitSelectForUpdate = true").unwrap());
    assert_eq!(read_balance(stmt.as_mut(), 1).unwrap(), 100);
    bank.abort_commits(1);
    conn.commit().unwrap();

    let expected = locked(&balance_sql(1));
    assert_eq!(bank.journal(), vec![expected.clone(), expected]);
    assert!(!conn.row_locking());
}

#[test]
fn test_toggle_off_overrides_default() {
    let bank = Bank::new(&[(1, 100)]);
    let mut conn = bank.connect(fast_options().with_implicit_row_locking(true));
    let mut stmt = conn.create_statement().unwrap();

    stmt.execute("set implicitselectforupdate = false").unwrap();
    read_balance(stmt.as_mut(), 1).unwrap();
    conn.commit().unwrap();
    read_balance(stmt.as_mut(), 1).unwrap();
    conn.commit().unwrap();

    assert_eq!(
        bank.journal(),
        vec![balance_sql(1), locked(&balance_sql(1))]
    );
}

#[test]
fn test_read_only_connections_never_lock() {
    let bank = Bank::new(&[(1, 100)]);
    let mut conn = bank.connect(fast_options().with_implicit_row_locking(true));
    conn.set_read_only(true).unwrap();

    let mut stmt = conn.create_statement().unwrap();
    read_balance(stmt.as_mut(), 1).unwrap();
    assert_eq!(bank.journal(), vec![balance_sql(1)]);
}

#[test]
fn test_prepared_queries_are_rewritten() {
    let bank = Bank::new(&[(1, 100)]);
    let mut conn = bank.connect(fast_options().with_implicit_row_locking(true));

    let mut stmt = conn
        .prepare_statement("select balance from accounts where id = ?")
        .unwrap();
    stmt.set_parameter(1, Value::Int(1)).unwrap();
    stmt.execute_query().unwrap();

    assert_eq!(
        bank.journal(),
        vec![locked("select balance from accounts where id = ?")]
    );
}

#[test]
fn test_aggregates_are_not_locked() {
    let bank = Bank::new(&[(1, 100)]);
    let mut conn = bank.connect(fast_options().with_implicit_row_locking(true));
    let mut stmt = conn.create_statement().unwrap();

    stmt.execute_query("select sum(balance) from accounts").unwrap();
    stmt.execute_query("select id from accounts for update").unwrap();
    assert_eq!(
        bank.journal(),
        vec![
            "select sum(balance) from accounts",
            "select id from accounts for update",
        ]
    );
}
