//! Statement proxies
//!
//! [`RetryStatement`] and [`RetryPreparedStatement`] record every call they
//! forward. A retryable failure of a statement call hands control to the
//! owning connection, which replays the whole transaction onto a fresh
//! connection and then lets the statement re-issue the failed call.
//!
//! Queries are passed through the connection's query processor before they
//! reach the driver, and `SET implicitSelectForUpdate = ...` is intercepted
//! by `execute` instead of being sent to the server.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlreplay_core::{Error, PreparedStatement, Result, ResultSet, Statement, Value};
use sqlreplay_query::parse_control_statement;
use tracing::debug;

use crate::connection::{RetryLoop, SharedCoordinator};
use crate::execution::{Call, ExecutionLog, ExecutionRecord, HandleId};
use crate::result::{CursorState, RetryResultSet, SharedCursor};
use crate::trace::CallTracer;

/// The physical statement behind a proxy
pub(crate) enum StatementDelegate {
    Plain(Box<dyn Statement>),
    Prepared(Box<dyn PreparedStatement>),
}

impl StatementDelegate {
    fn kind(&self) -> &'static str {
        match self {
            StatementDelegate::Plain(_) => "statement",
            StatementDelegate::Prepared(_) => "prepared_statement",
        }
    }
}

/// A call on a statement
///
/// SQL-taking variants carry `None` on prepared statements, which execute
/// the text they were prepared with.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementCall {
    /// Execute any statement
    Execute(Option<String>),
    /// Execute a query
    ExecuteQuery(Option<String>),
    /// Execute an update
    ExecuteUpdate(Option<String>),
    /// Queue a batch entry
    AddBatch(Option<String>),
    /// Run the queued batch
    ExecuteBatch,
    /// Fetch the cursor of the last `execute`
    ResultSet,
    /// Fetch the row count of the last `execute`
    UpdateCount,
    /// Limit cursor rows
    SetMaxRows(usize),
    /// Bind a parameter
    SetParameter(usize, Value),
    /// Clear parameter bindings
    ClearParameters,
    /// Release the statement
    Close,
}

impl Call for StatementCall {
    fn operation(&self) -> &'static str {
        match self {
            StatementCall::Execute(_) => "execute",
            StatementCall::ExecuteQuery(_) => "execute_query",
            StatementCall::ExecuteUpdate(_) => "execute_update",
            StatementCall::AddBatch(_) => "add_batch",
            StatementCall::ExecuteBatch => "execute_batch",
            StatementCall::ResultSet => "result_set",
            StatementCall::UpdateCount => "update_count",
            StatementCall::SetMaxRows(_) => "set_max_rows",
            StatementCall::SetParameter(..) => "set_parameter",
            StatementCall::ClearParameters => "clear_parameters",
            StatementCall::Close => "close",
        }
    }

    fn arguments(&self) -> Vec<String> {
        match self {
            StatementCall::Execute(Some(sql))
            | StatementCall::ExecuteQuery(Some(sql))
            | StatementCall::ExecuteUpdate(Some(sql))
            | StatementCall::AddBatch(Some(sql)) => vec![format!("\"{}\"", sql)],
            StatementCall::SetMaxRows(max) => vec![max.to_string()],
            StatementCall::SetParameter(index, value) => vec![
                index.to_string(),
                value.canonical_text().unwrap_or_else(|| "NULL".to_string()),
            ],
            _ => Vec::new(),
        }
    }
}

/// Recorded result of a statement call
#[derive(Debug, Clone)]
pub(crate) enum StatementOutput {
    /// No result
    Unit,
    /// Result of `execute`
    Bool(bool),
    /// Affected rows
    Count(u64),
    /// Affected rows per batch entry
    Counts(Vec<u64>),
    /// Row count of the last `execute`, if any
    MaybeCount(Option<u64>),
    /// Cursor, shared with the proxy handed to the caller
    Cursor(Option<SharedCursor>),
}

impl StatementOutput {
    fn kind(&self) -> &'static str {
        match self {
            StatementOutput::Unit => "unit",
            StatementOutput::Bool(_) => "bool",
            StatementOutput::Count(_) => "count",
            StatementOutput::Counts(_) => "counts",
            StatementOutput::MaybeCount(_) => "optional count",
            StatementOutput::Cursor(_) => "cursor",
        }
    }

    fn mismatch(&self, expected: &str) -> Error {
        Error::InvalidState(format!(
            "statement call returned {} where {} was expected",
            self.kind(),
            expected
        ))
    }

    fn into_unit(self) -> Result<()> {
        match self {
            StatementOutput::Unit => Ok(()),
            other => Err(other.mismatch("unit")),
        }
    }

    fn into_bool(self) -> Result<bool> {
        match self {
            StatementOutput::Bool(b) => Ok(b),
            other => Err(other.mismatch("bool")),
        }
    }

    fn into_count(self) -> Result<u64> {
        match self {
            StatementOutput::Count(n) => Ok(n),
            other => Err(other.mismatch("count")),
        }
    }

    fn into_counts(self) -> Result<Vec<u64>> {
        match self {
            StatementOutput::Counts(n) => Ok(n),
            other => Err(other.mismatch("counts")),
        }
    }

    fn into_maybe_count(self) -> Result<Option<u64>> {
        match self {
            StatementOutput::MaybeCount(n) => Ok(n),
            other => Err(other.mismatch("optional count")),
        }
    }

    fn into_result_set(self) -> Result<Option<Box<dyn ResultSet>>> {
        match self {
            StatementOutput::Cursor(cursor) => Ok(cursor
                .map(|state| Box::new(RetryResultSet::new(state)) as Box<dyn ResultSet>)),
            other => Err(other.mismatch("cursor")),
        }
    }

    fn into_query_result(self) -> Result<Box<dyn ResultSet>> {
        self.into_result_set()?
            .ok_or_else(|| Error::InvalidState("query produced no result set".to_string()))
    }
}

/// What the delegate returned, before cursors are wrapped
enum Returned {
    Unit,
    Bool(bool),
    Count(u64),
    Counts(Vec<u64>),
    MaybeCount(Option<u64>),
    Cursor(Option<Box<dyn ResultSet>>),
}

fn unsupported(delegate: &str, call: &StatementCall) -> Error {
    Error::InvalidState(format!(
        "{} is not supported on a {}",
        call.operation(),
        delegate
    ))
}

fn invoke_plain(stmt: &mut dyn Statement, call: &StatementCall) -> Result<Returned> {
    match call {
        StatementCall::Execute(Some(sql)) => stmt.execute(sql).map(Returned::Bool),
        StatementCall::ExecuteQuery(Some(sql)) => {
            stmt.execute_query(sql).map(|rs| Returned::Cursor(Some(rs)))
        }
        StatementCall::ExecuteUpdate(Some(sql)) => stmt.execute_update(sql).map(Returned::Count),
        StatementCall::AddBatch(Some(sql)) => stmt.add_batch(sql).map(|_| Returned::Unit),
        StatementCall::ExecuteBatch => stmt.execute_batch().map(Returned::Counts),
        StatementCall::ResultSet => stmt.result_set().map(Returned::Cursor),
        StatementCall::UpdateCount => stmt.update_count().map(Returned::MaybeCount),
        StatementCall::SetMaxRows(max) => stmt.set_max_rows(*max).map(|_| Returned::Unit),
        StatementCall::Close => stmt.close().map(|_| Returned::Unit),
        other => Err(unsupported("statement", other)),
    }
}

fn invoke_prepared(stmt: &mut dyn PreparedStatement, call: &StatementCall) -> Result<Returned> {
    match call {
        StatementCall::Execute(None) => stmt.execute().map(Returned::Bool),
        StatementCall::ExecuteQuery(None) => {
            stmt.execute_query().map(|rs| Returned::Cursor(Some(rs)))
        }
        StatementCall::ExecuteUpdate(None) => stmt.execute_update().map(Returned::Count),
        StatementCall::AddBatch(None) => stmt.add_batch().map(|_| Returned::Unit),
        StatementCall::ExecuteBatch => stmt.execute_batch().map(Returned::Counts),
        StatementCall::ResultSet => stmt.result_set().map(Returned::Cursor),
        StatementCall::UpdateCount => stmt.update_count().map(Returned::MaybeCount),
        StatementCall::SetMaxRows(max) => stmt.set_max_rows(*max).map(|_| Returned::Unit),
        StatementCall::SetParameter(index, value) => stmt
            .set_parameter(*index, value.clone())
            .map(|_| Returned::Unit),
        StatementCall::ClearParameters => stmt.clear_parameters().map(|_| Returned::Unit),
        StatementCall::Close => stmt.close().map(|_| Returned::Unit),
        other => Err(unsupported("prepared statement", other)),
    }
}

fn invoke(delegate: &mut StatementDelegate, call: &StatementCall) -> Result<Returned> {
    match delegate {
        StatementDelegate::Plain(stmt) => invoke_plain(stmt.as_mut(), call),
        StatementDelegate::Prepared(stmt) => invoke_prepared(stmt.as_mut(), call),
    }
}

/// Statement state shared between a proxy and the connection log entry
/// that created it
pub(crate) type SharedStatement = Arc<Mutex<StatementState>>;

pub(crate) struct StatementState {
    id: HandleId,
    delegate: StatementDelegate,
    log: ExecutionLog<StatementCall, StatementOutput>,
    recording: bool,
    retired: bool,
    tracer: CallTracer,
}

impl fmt::Debug for StatementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementState")
            .field("id", &self.id)
            .field("calls", &self.log.len())
            .field("retired", &self.retired)
            .finish()
    }
}

impl StatementState {
    pub(crate) fn new(delegate: StatementDelegate, recording: bool, tracer: CallTracer) -> Self {
        StatementState {
            id: HandleId::next(delegate.kind()),
            delegate,
            log: ExecutionLog::new(),
            recording,
            retired: false,
            tracer,
        }
    }

    pub(crate) fn shared(self) -> SharedStatement {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn history_len(&self) -> usize {
        self.log.len()
    }

    /// The caller dropped or closed the proxy
    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    /// Forget the calls of a finished transaction
    ///
    /// Parameter bindings and the row limit stay on the driver statement
    /// across transactions, so the latest successful value of each survives
    /// for the next replay.
    pub(crate) fn clear_history(&mut self) {
        let mut kept: Vec<ExecutionRecord<StatementCall, StatementOutput>> = Vec::new();
        for record in self.log.take() {
            if !record.succeeded() {
                continue;
            }
            match record.call() {
                StatementCall::SetParameter(index, _) => {
                    let index = *index;
                    kept.retain(|earlier| {
                        !matches!(earlier.call(), StatementCall::SetParameter(i, _) if *i == index)
                    });
                    kept.push(record);
                }
                StatementCall::SetMaxRows(_) => {
                    kept.retain(|earlier| !matches!(earlier.call(), StatementCall::SetMaxRows(_)));
                    kept.push(record);
                }
                StatementCall::ClearParameters => {
                    kept.retain(|earlier| {
                        !matches!(earlier.call(), StatementCall::SetParameter(..))
                    });
                }
                _ => {}
            }
        }
        for record in kept {
            self.log.push(record);
        }
    }

    pub(crate) fn call(&mut self, call: StatementCall) -> Result<StatementOutput> {
        let delegate = &mut self.delegate;
        let (result, elapsed) = self
            .tracer
            .run(self.id, &call, || invoke(delegate, &call));
        let output = result.map(|returned| match returned {
            Returned::Unit => StatementOutput::Unit,
            Returned::Bool(b) => StatementOutput::Bool(b),
            Returned::Count(n) => StatementOutput::Count(n),
            Returned::Counts(n) => StatementOutput::Counts(n),
            Returned::MaybeCount(n) => StatementOutput::MaybeCount(n),
            Returned::Cursor(rs) => StatementOutput::Cursor(
                rs.map(|rs| CursorState::new(rs, self.recording, self.tracer).shared()),
            ),
        });
        if self.recording {
            self.log
                .push(ExecutionRecord::new(self.id, call, output.clone(), elapsed));
        }
        output
    }

    /// Swap in `delegate` and re-issue every successful call
    ///
    /// Cursors handed out earlier are replayed against the new cursors and
    /// keep serving their callers. Update counts are not compared.
    pub(crate) fn replay(&mut self, delegate: StatementDelegate) -> Result<()> {
        self.delegate = delegate;
        self.id = HandleId::next(self.delegate.kind());
        let id = self.id;
        let tracer = self.tracer;
        let delegate = &mut self.delegate;

        for record in self.log.iter_mut() {
            if !record.succeeded() {
                continue;
            }
            let call = record.call();
            let (result, elapsed) = tracer.run(id, call, || invoke(&mut *delegate, call));
            let returned = result?;
            let cursor = match record.outcome() {
                Ok(StatementOutput::Cursor(Some(cursor))) => Some(cursor.clone()),
                _ => None,
            };
            match (cursor, returned) {
                (Some(cursor), Returned::Cursor(Some(rs))) => cursor.lock().replay(rs)?,
                (Some(_), _) | (None, Returned::Cursor(Some(_))) => {
                    debug!(
                        target: "sqlreplay::retry",
                        statement = %id,
                        operation = record.call().operation(),
                        "Cursor appeared or vanished on replay"
                    );
                    return Err(Error::ConcurrentUpdate);
                }
                (None, returned) => {
                    let output = match returned {
                        Returned::Unit => StatementOutput::Unit,
                        Returned::Bool(b) => StatementOutput::Bool(b),
                        Returned::Count(n) => StatementOutput::Count(n),
                        Returned::Counts(n) => StatementOutput::Counts(n),
                        Returned::MaybeCount(n) => StatementOutput::MaybeCount(n),
                        Returned::Cursor(_) => StatementOutput::Cursor(None),
                    };
                    record.replace_result(id, output, elapsed);
                }
            }
        }
        Ok(())
    }
}

/// Shared plumbing of both statement proxies
struct StatementHandle {
    connection: SharedCoordinator,
    state: SharedStatement,
}

impl StatementHandle {
    /// Forward `call`, recovering the transaction on retryable failures
    fn call(&self, call: StatementCall) -> Result<StatementOutput> {
        self.connection.lock().begin();
        let mut retry = RetryLoop::new(call.operation());
        loop {
            // the statement lock must be released before recovery takes the
            // connection lock
            let result = self.state.lock().call(call.clone());
            match result {
                Ok(output) => return Ok(output),
                Err(cause) => self.connection.lock().recover(cause, &mut retry)?,
            }
        }
    }

    fn rewrite(&self, sql: &str) -> Result<String> {
        self.connection.lock().rewrite(sql)
    }

    fn handle_id(&self) -> HandleId {
        self.state.lock().id()
    }

    fn history_len(&self) -> usize {
        self.state.lock().history_len()
    }

    fn close(&self) -> Result<()> {
        let result = self.call(StatementCall::Close).and_then(StatementOutput::into_unit);
        self.state.lock().retire();
        result
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        self.state.lock().retire();
    }
}

/// Ad-hoc statement proxy handed out by a retrying connection
pub struct RetryStatement {
    handle: StatementHandle,
}

impl RetryStatement {
    pub(crate) fn new(connection: SharedCoordinator, state: SharedStatement) -> Self {
        RetryStatement {
            handle: StatementHandle { connection, state },
        }
    }

    /// Identity of the physical statement currently behind this proxy
    pub fn handle_id(&self) -> HandleId {
        self.handle.handle_id()
    }

    /// Number of calls recorded for the current transaction
    pub fn history_len(&self) -> usize {
        self.handle.history_len()
    }
}

impl fmt::Debug for RetryStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryStatement").field(&*self.handle.state.lock()).finish()
    }
}

impl Statement for RetryStatement {
    fn execute(&mut self, sql: &str) -> Result<bool> {
        if let Some(enabled) = parse_control_statement(sql) {
            self.handle
                .connection
                .lock()
                .set_row_locking_override(enabled)?;
            return Ok(true);
        }
        self.handle
            .call(StatementCall::Execute(Some(sql.to_string())))?
            .into_bool()
    }

    fn execute_query(&mut self, sql: &str) -> Result<Box<dyn ResultSet>> {
        let sql = self.handle.rewrite(sql)?;
        self.handle
            .call(StatementCall::ExecuteQuery(Some(sql)))?
            .into_query_result()
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64> {
        self.handle
            .call(StatementCall::ExecuteUpdate(Some(sql.to_string())))?
            .into_count()
    }

    fn add_batch(&mut self, sql: &str) -> Result<()> {
        self.handle
            .call(StatementCall::AddBatch(Some(sql.to_string())))?
            .into_unit()
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.handle.call(StatementCall::ExecuteBatch)?.into_counts()
    }

    fn result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>> {
        self.handle.call(StatementCall::ResultSet)?.into_result_set()
    }

    fn update_count(&mut self) -> Result<Option<u64>> {
        self.handle.call(StatementCall::UpdateCount)?.into_maybe_count()
    }

    fn set_max_rows(&mut self, max: usize) -> Result<()> {
        self.handle.call(StatementCall::SetMaxRows(max))?.into_unit()
    }

    fn close(&mut self) -> Result<()> {
        self.handle.close()
    }
}

/// Prepared statement proxy handed out by a retrying connection
///
/// The statement text was rewritten when it was prepared.
pub struct RetryPreparedStatement {
    handle: StatementHandle,
}

impl RetryPreparedStatement {
    pub(crate) fn new(connection: SharedCoordinator, state: SharedStatement) -> Self {
        RetryPreparedStatement {
            handle: StatementHandle { connection, state },
        }
    }

    /// Identity of the physical statement currently behind this proxy
    pub fn handle_id(&self) -> HandleId {
        self.handle.handle_id()
    }

    /// Number of calls recorded for the current transaction
    pub fn history_len(&self) -> usize {
        self.handle.history_len()
    }
}

impl fmt::Debug for RetryPreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryPreparedStatement")
            .field(&*self.handle.state.lock())
            .finish()
    }
}

impl PreparedStatement for RetryPreparedStatement {
    fn set_parameter(&mut self, index: usize, value: Value) -> Result<()> {
        self.handle
            .call(StatementCall::SetParameter(index, value))?
            .into_unit()
    }

    fn clear_parameters(&mut self) -> Result<()> {
        self.handle.call(StatementCall::ClearParameters)?.into_unit()
    }

    fn execute(&mut self) -> Result<bool> {
        self.handle.call(StatementCall::Execute(None))?.into_bool()
    }

    fn execute_query(&mut self) -> Result<Box<dyn ResultSet>> {
        self.handle
            .call(StatementCall::ExecuteQuery(None))?
            .into_query_result()
    }

    fn execute_update(&mut self) -> Result<u64> {
        self.handle.call(StatementCall::ExecuteUpdate(None))?.into_count()
    }

    fn add_batch(&mut self) -> Result<()> {
        self.handle.call(StatementCall::AddBatch(None))?.into_unit()
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.handle.call(StatementCall::ExecuteBatch)?.into_counts()
    }

    fn result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>> {
        self.handle.call(StatementCall::ResultSet)?.into_result_set()
    }

    fn update_count(&mut self) -> Result<Option<u64>> {
        self.handle.call(StatementCall::UpdateCount)?.into_maybe_count()
    }

    fn set_max_rows(&mut self, max: usize) -> Result<()> {
        self.handle.call(StatementCall::SetMaxRows(max))?.into_unit()
    }

    fn close(&mut self) -> Result<()> {
        self.handle.close()
    }
}
