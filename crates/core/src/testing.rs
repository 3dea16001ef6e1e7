//! In-memory scriptable driver
//!
//! `MockDatabase` stands in for a real client library in tests. It serves
//! canned rows per SQL text, counts every call per operation, keeps a journal
//! of executed SQL, and can be told to fail a given operation a number of
//! times with a given error.
//!
//! All handles opened from one `MockDatabase` share its state, so a test can
//! change the canned rows between an original execution and a replay.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{sql_state, Error, Result};
use crate::traits::{Connection, ConnectionFactory, PreparedStatement, ResultSet, Statement};
use crate::types::{Column, IsolationLevel, StreamKind};
use crate::value::Value;

/// Driver operation, used for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Opening a connection
    Connect,
    /// `Connection::commit`
    Commit,
    /// `Connection::rollback`
    Rollback,
    /// `Connection::close`
    Close,
    /// `Connection::set_auto_commit`
    SetAutoCommit,
    /// `Connection::prepare_statement`
    Prepare,
    /// `Connection::create_statement`
    CreateStatement,
    /// `execute` on either statement kind
    Execute,
    /// `execute_query` on either statement kind
    ExecuteQuery,
    /// `execute_update` on either statement kind
    ExecuteUpdate,
    /// `execute_batch` on either statement kind
    ExecuteBatch,
    /// `ResultSet::next`
    Next,
    /// `ResultSet::get`
    Get,
    /// `ResultSet::get_stream`
    GetStream,
    /// `Connection::is_valid`
    IsValid,
}

#[derive(Debug, Clone)]
struct CannedRows {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct Failure {
    op: Op,
    skip: usize,
    remaining: Option<usize>,
    error: Error,
}

#[derive(Debug)]
struct MockState {
    results: HashMap<String, CannedRows>,
    update_counts: HashMap<String, u64>,
    failures: Vec<Failure>,
    calls: HashMap<Op, usize>,
    connections_opened: usize,
    valid: bool,
    auto_commit_on_connect: bool,
    warnings: Vec<String>,
    journal: Vec<String>,
    bindings: Vec<Vec<Value>>,
}

impl MockState {
    fn new() -> Self {
        MockState {
            results: HashMap::new(),
            update_counts: HashMap::new(),
            failures: Vec::new(),
            calls: HashMap::new(),
            connections_opened: 0,
            valid: true,
            auto_commit_on_connect: false,
            warnings: Vec::new(),
            journal: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Count a call and hand out a scripted failure, if one is due
    fn enter(&mut self, op: Op) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        let Some(pos) = self.failures.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        let failure = &mut self.failures[pos];
        if failure.skip > 0 {
            failure.skip -= 1;
            return Ok(());
        }
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            Some(n) => {
                *n -= 1;
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(pos);
        }
        Err(error)
    }

    fn rows_for(&self, sql: &str) -> Option<CannedRows> {
        self.results.get(sql).cloned()
    }
}

/// Shared, scriptable in-memory database
#[derive(Debug, Clone)]
pub struct MockDatabase {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatabase {
    /// Create an empty database. Connections start valid and not in auto-commit.
    pub fn new() -> Self {
        MockDatabase {
            state: Arc::new(Mutex::new(MockState::new())),
        }
    }

    /// Serve `rows` for queries whose text is exactly `sql`
    pub fn set_rows(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.state.lock().results.insert(
            sql.to_string(),
            CannedRows {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
    }

    /// Report `count` affected rows for updates whose text is exactly `sql`
    pub fn set_update_count(&self, sql: &str, count: u64) {
        self.state.lock().update_counts.insert(sql.to_string(), count);
    }

    /// Fail every call of `op` with `error` until cleared
    pub fn fail(&self, op: Op, error: Error) {
        self.push_failure(op, 0, None, error);
    }

    /// Fail the next `times` calls of `op` with `error`
    pub fn fail_times(&self, op: Op, times: usize, error: Error) {
        self.fail_after(op, 0, times, error);
    }

    /// Let `skip` calls of `op` succeed, then fail the following `times`
    pub fn fail_after(&self, op: Op, skip: usize, times: usize, error: Error) {
        if times > 0 {
            self.push_failure(op, skip, Some(times), error);
        }
    }

    fn push_failure(&self, op: Op, skip: usize, remaining: Option<usize>, error: Error) {
        self.state.lock().failures.push(Failure {
            op,
            skip,
            remaining,
            error,
        });
    }

    /// Drop all scripted failures
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Answer for every subsequent liveness probe
    pub fn set_valid(&self, valid: bool) {
        self.state.lock().valid = valid;
    }

    /// Auto-commit mode of connections opened from now on
    pub fn set_auto_commit_on_connect(&self, auto_commit: bool) {
        self.state.lock().auto_commit_on_connect = auto_commit;
    }

    /// Warnings reported by every connection
    pub fn set_warnings(&self, warnings: Vec<String>) {
        self.state.lock().warnings = warnings;
    }

    /// Number of calls made to `op`, failed calls included
    pub fn calls(&self, op: Op) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of connections successfully opened
    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    /// SQL text of every statement executed, in order
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Parameter values of every successful prepared execution, in order
    pub fn executed_bindings(&self) -> Vec<Vec<Value>> {
        self.state.lock().bindings.clone()
    }

    /// Open a connection
    pub fn connect(&self) -> Result<MockConnection> {
        let mut state = self.state.lock();
        state.enter(Op::Connect)?;
        state.connections_opened += 1;
        let auto_commit = state.auto_commit_on_connect;
        drop(state);

        Ok(MockConnection {
            db: self.clone(),
            closed: false,
            auto_commit,
            read_only: false,
            isolation: IsolationLevel::Serializable,
        })
    }

    /// Connection factory opening handles on this database
    pub fn factory(&self) -> MockFactory {
        MockFactory { db: self.clone() }
    }

    fn enter(&self, op: Op) -> Result<()> {
        self.state.lock().enter(op)
    }

    fn record(&self, sql: &str) {
        self.state.lock().journal.push(sql.to_string());
    }
}

/// [`ConnectionFactory`] over a [`MockDatabase`]
#[derive(Debug, Clone)]
pub struct MockFactory {
    db: MockDatabase,
}

impl ConnectionFactory for MockFactory {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.db.connect()?))
    }
}

fn closed_error(what: &str) -> Error {
    Error::sql(
        sql_state::CONNECTION_DOES_NOT_EXIST,
        format!("This {} has been closed.", what),
    )
}

/// Mock connection handle
#[derive(Debug)]
pub struct MockConnection {
    db: MockDatabase,
    closed: bool,
    auto_commit: bool,
    read_only: bool,
    isolation: IsolationLevel,
}

impl MockConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(closed_error("connection"));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn create_statement(&mut self) -> Result<Box<dyn Statement>> {
        self.db.enter(Op::CreateStatement)?;
        self.check_open()?;
        Ok(Box::new(MockStatement::new(self.db.clone(), None)))
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.db.enter(Op::Prepare)?;
        self.check_open()?;
        Ok(Box::new(MockStatement::new(
            self.db.clone(),
            Some(sql.to_string()),
        )))
    }

    fn commit(&mut self) -> Result<()> {
        self.db.enter(Op::Commit)?;
        self.check_open()
    }

    fn rollback(&mut self) -> Result<()> {
        self.db.enter(Op::Rollback)?;
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.db.enter(Op::Close)?;
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> Result<bool> {
        Ok(self.closed)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.db.enter(Op::SetAutoCommit)?;
        self.check_open()?;
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.auto_commit)
    }

    fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.check_open()?;
        self.read_only = read_only;
        Ok(())
    }

    fn is_read_only(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.read_only)
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.check_open()?;
        self.isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> Result<IsolationLevel> {
        self.check_open()?;
        Ok(self.isolation)
    }

    fn is_valid(&mut self, _timeout: Duration) -> Result<bool> {
        self.db.enter(Op::IsValid)?;
        Ok(!self.closed && self.db.state.lock().valid)
    }

    fn warnings(&self) -> Result<Vec<String>> {
        Ok(self.db.state.lock().warnings.clone())
    }
}

/// Mock statement, ad-hoc when `sql` is `None`, prepared otherwise
#[derive(Debug)]
pub struct MockStatement {
    db: MockDatabase,
    sql: Option<String>,
    parameters: HashMap<usize, Value>,
    batch: Vec<String>,
    current: Option<MockResultSet>,
    update_count: Option<u64>,
    max_rows: usize,
    closed: bool,
}

impl MockStatement {
    fn new(db: MockDatabase, sql: Option<String>) -> Self {
        MockStatement {
            db,
            sql,
            parameters: HashMap::new(),
            batch: Vec::new(),
            current: None,
            update_count: None,
            max_rows: 0,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(closed_error("statement"));
        }
        Ok(())
    }

    fn prepared_sql(&self) -> Result<String> {
        self.sql
            .clone()
            .ok_or_else(|| Error::InvalidState("statement was not prepared".into()))
    }

    /// Values for every `?` placeholder, failing like a server on a gap
    fn bound_parameters(&self, sql: &str) -> Result<Vec<Value>> {
        let placeholders = sql.matches('?').count();
        (1..=placeholders)
            .map(|index| {
                self.parameters.get(&index).cloned().ok_or_else(|| {
                    Error::sql(
                        sql_state::INVALID_PARAMETER_VALUE,
                        format!("No value specified for parameter {}.", index),
                    )
                })
            })
            .collect()
    }

    fn run_prepared<T>(&mut self, run: impl FnOnce(&mut Self, &str) -> Result<T>) -> Result<T> {
        let sql = self.prepared_sql()?;
        let bound = self.bound_parameters(&sql)?;
        let out = run(self, &sql)?;
        self.db.state.lock().bindings.push(bound);
        Ok(out)
    }

    fn query(&self, sql: &str) -> MockResultSet {
        let canned = self.db.state.lock().rows_for(sql).unwrap_or(CannedRows {
            columns: Vec::new(),
            rows: Vec::new(),
        });
        let mut rows = canned.rows;
        if self.max_rows > 0 {
            rows.truncate(self.max_rows);
        }
        MockResultSet::new(self.db.clone(), canned.columns, rows)
    }

    fn run(&mut self, op: Op, sql: &str) -> Result<bool> {
        self.db.enter(op)?;
        self.check_open()?;
        self.db.record(sql);

        let has_rows = self.db.state.lock().results.contains_key(sql);
        if has_rows {
            self.current = Some(self.query(sql));
            self.update_count = None;
        } else {
            self.current = None;
            self.update_count = Some(self.count_for(sql));
        }
        Ok(has_rows)
    }

    fn run_query(&mut self, sql: &str) -> Result<Box<dyn ResultSet>> {
        self.db.enter(Op::ExecuteQuery)?;
        self.check_open()?;
        self.db.record(sql);
        Ok(Box::new(self.query(sql)))
    }

    fn run_update(&mut self, sql: &str) -> Result<u64> {
        self.db.enter(Op::ExecuteUpdate)?;
        self.check_open()?;
        self.db.record(sql);
        Ok(self.count_for(sql))
    }

    fn run_batch(&mut self) -> Result<Vec<u64>> {
        self.db.enter(Op::ExecuteBatch)?;
        self.check_open()?;
        let batch = std::mem::take(&mut self.batch);
        let mut counts = Vec::with_capacity(batch.len());
        for sql in &batch {
            self.db.record(sql);
            counts.push(self.count_for(sql));
        }
        Ok(counts)
    }

    fn count_for(&self, sql: &str) -> u64 {
        self.db
            .state
            .lock()
            .update_counts
            .get(sql)
            .copied()
            .unwrap_or(0)
    }

    fn take_result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>> {
        self.check_open()?;
        Ok(self
            .current
            .take()
            .map(|rs| Box::new(rs) as Box<dyn ResultSet>))
    }
}

impl Statement for MockStatement {
    fn execute(&mut self, sql: &str) -> Result<bool> {
        self.run(Op::Execute, sql)
    }

    fn execute_query(&mut self, sql: &str) -> Result<Box<dyn ResultSet>> {
        self.run_query(sql)
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64> {
        self.run_update(sql)
    }

    fn add_batch(&mut self, sql: &str) -> Result<()> {
        self.check_open()?;
        self.batch.push(sql.to_string());
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.run_batch()
    }

    fn result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>> {
        self.take_result_set()
    }

    fn update_count(&mut self) -> Result<Option<u64>> {
        self.check_open()?;
        Ok(self.update_count)
    }

    fn set_max_rows(&mut self, max: usize) -> Result<()> {
        self.check_open()?;
        self.max_rows = max;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl PreparedStatement for MockStatement {
    fn set_parameter(&mut self, index: usize, value: Value) -> Result<()> {
        self.check_open()?;
        if index == 0 {
            return Err(Error::InvalidArgument(
                "parameter indexes start at 1".into(),
            ));
        }
        self.parameters.insert(index, value);
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<()> {
        self.check_open()?;
        self.parameters.clear();
        Ok(())
    }

    fn execute(&mut self) -> Result<bool> {
        self.run_prepared(|stmt, sql| stmt.run(Op::Execute, sql))
    }

    fn execute_query(&mut self) -> Result<Box<dyn ResultSet>> {
        self.run_prepared(|stmt, sql| stmt.run_query(sql))
    }

    fn execute_update(&mut self) -> Result<u64> {
        self.run_prepared(|stmt, sql| stmt.run_update(sql))
    }

    fn add_batch(&mut self) -> Result<()> {
        let sql = self.prepared_sql()?;
        self.check_open()?;
        self.batch.push(sql);
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.run_batch()
    }

    fn result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>> {
        self.take_result_set()
    }

    fn update_count(&mut self) -> Result<Option<u64>> {
        self.check_open()?;
        Ok(self.update_count)
    }

    fn set_max_rows(&mut self, max: usize) -> Result<()> {
        self.check_open()?;
        self.max_rows = max;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Mock cursor over a snapshot of canned rows
#[derive(Debug)]
pub struct MockResultSet {
    db: MockDatabase,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    position: Option<usize>,
    last_null: bool,
    closed: bool,
}

impl MockResultSet {
    fn new(db: MockDatabase, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        MockResultSet {
            db,
            columns,
            rows,
            position: None,
            last_null: false,
            closed: false,
        }
    }

    fn value(&mut self, column: &Column) -> Result<Value> {
        if self.closed {
            return Err(closed_error("result set"));
        }
        let row = self
            .position
            .and_then(|p| self.rows.get(p))
            .ok_or_else(|| Error::InvalidState("cursor is not positioned on a row".into()))?;
        let index = match column {
            Column::Index(i) if *i >= 1 && *i <= self.columns.len() => i - 1,
            Column::Label(label) => self
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(label))
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("no column labelled {}", label))
                })?,
            Column::Index(i) => {
                return Err(Error::InvalidArgument(format!(
                    "column index {} out of range",
                    i
                )))
            }
        };
        let value = row.get(index).cloned().unwrap_or(Value::Null);
        self.last_null = value.is_null();
        Ok(value)
    }
}

impl ResultSet for MockResultSet {
    fn next(&mut self) -> Result<bool> {
        self.db.enter(Op::Next)?;
        if self.closed {
            return Err(closed_error("result set"));
        }
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next.min(self.rows.len()));
        Ok(next < self.rows.len())
    }

    fn get(&mut self, column: &Column) -> Result<Value> {
        self.db.enter(Op::Get)?;
        self.value(column)
    }

    fn get_stream(&mut self, column: &Column, _kind: StreamKind) -> Result<Box<dyn Read + Send>> {
        self.db.enter(Op::GetStream)?;
        let bytes = match self.value(column)? {
            Value::Null => Vec::new(),
            Value::Bytes(b) => b,
            other => other.canonical_text().unwrap_or_default().into_bytes(),
        };
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn was_null(&mut self) -> Result<bool> {
        Ok(self.last_null)
    }

    fn column_names(&mut self) -> Result<Vec<String>> {
        Ok(self.columns.clone())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
