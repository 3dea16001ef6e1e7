//! Shared test utilities for all integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub use sqlreplay_core::testing::{MockDatabase, Op};
pub use sqlreplay::{
    Connection, Driver, DriverOptions, Error, PreparedStatement, ResultSet, ResultSetExt,
    RetryConnection, RetryContext, RetryListener, Statement, Value,
};

// ============================================================================
// Initialization
// ============================================================================

/// Route `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Bank - accounts table on the mock database
// ============================================================================

/// SQL reading the balance of account `id`.
pub fn balance_sql(id: u32) -> String {
    format!("select balance from accounts where id = {}", id)
}

/// SQL changing the balance of account `id` by `delta`.
pub fn adjust_sql(id: u32, delta: i64) -> String {
    format!(
        "update accounts set balance = balance + {} where id = {}",
        delta, id
    )
}

/// Mock database serving an `accounts` table.
pub struct Bank {
    pub db: MockDatabase,
}

impl Bank {
    /// Create accounts with the given balances.
    pub fn new(accounts: &[(u32, i64)]) -> Self {
        let bank = Bank {
            db: MockDatabase::new(),
        };
        for &(id, balance) in accounts {
            bank.set_balance(id, balance);
        }
        bank
    }

    /// Change what the database returns for an account balance, with and
    /// without a locking clause.
    pub fn set_balance(&self, id: u32, balance: i64) {
        let sql = balance_sql(id);
        self.db
            .set_rows(&sql, &["balance"], vec![vec![Value::Int(balance)]]);
        self.db.set_rows(
            &format!("{} FOR UPDATE", sql),
            &["balance"],
            vec![vec![Value::Int(balance)]],
        );
    }

    /// Driver over this bank.
    pub fn driver(&self, options: DriverOptions) -> Driver {
        Driver::new(self.db.factory(), options).unwrap()
    }

    /// Connection in explicit-transaction mode.
    pub fn connect(&self, options: DriverOptions) -> RetryConnection {
        let mut conn = self.driver(options).connect().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn
    }

    /// Fail the next `times` commits with a serialization failure.
    pub fn abort_commits(&self, times: usize) {
        self.db
            .fail_times(Op::Commit, times, Error::serialization_failure("restart transaction"));
    }

    /// Executed SQL, in order.
    pub fn journal(&self) -> Vec<String> {
        self.db.journal()
    }
}

/// Options with retries on and negligible backoff.
pub fn fast_options() -> DriverOptions {
    DriverOptions::new()
        .with_retry_transient_errors(true)
        .with_retry_max_attempts(5)
        .with_retry_max_backoff(Duration::from_millis(1))
        .with_retry_listener("none")
}

/// Read one balance through `stmt`.
pub fn read_balance(stmt: &mut dyn Statement, id: u32) -> sqlreplay::Result<i64> {
    let mut rs = stmt.execute_query(&balance_sql(id))?;
    if !rs.next()? {
        return Err(Error::InvalidState(format!("no account {}", id)));
    }
    rs.get_i64(1)?
        .ok_or_else(|| Error::InvalidState(format!("null balance for {}", id)))
}

/// Move `amount` from one account to another, returning both starting balances.
pub fn transfer(
    conn: &mut dyn Connection,
    from: u32,
    to: u32,
    amount: i64,
) -> sqlreplay::Result<(i64, i64)> {
    let mut stmt = conn.create_statement()?;
    let from_balance = read_balance(stmt.as_mut(), from)?;
    let to_balance = read_balance(stmt.as_mut(), to)?;
    stmt.execute_update(&adjust_sql(from, -amount))?;
    stmt.execute_update(&adjust_sql(to, amount))?;
    Ok((from_balance, to_balance))
}

// ============================================================================
// Listeners
// ============================================================================

/// Listener keeping a line per event.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
}

impl RetryListener for RecordingListener {
    fn before_retry(&self, ctx: &RetryContext, _backoff: Duration) {
        self.events
            .lock()
            .push(format!("before {} {}", ctx.operation, ctx.attempt));
    }

    fn after_retry(&self, ctx: &RetryContext, error: Option<&Error>, _elapsed: Duration) {
        let outcome = match error {
            None => "ok".to_string(),
            Some(e) => format!("failed {}", e.sql_state().unwrap_or("-")),
        };
        self.events
            .lock()
            .push(format!("after {} {} {}", ctx.operation, ctx.attempt, outcome));
    }
}

impl RecordingListener {
    /// Shared listener plus the handle a driver builder takes.
    pub fn shared() -> (Arc<RecordingListener>, Arc<dyn RetryListener>) {
        let listener = Arc::new(RecordingListener::default());
        let handle: Arc<dyn RetryListener> = listener.clone();
        (listener, handle)
    }
}
