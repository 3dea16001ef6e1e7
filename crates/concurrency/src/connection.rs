//! Retrying connection
//!
//! [`RetryConnection`] wraps a driver connection and records every call made
//! through it and through the statements and cursors it hands out. When a
//! call fails with an error the retry policy deems retryable, the coordinator:
//!
//! 1. rolls back and closes the poisoned connection
//! 2. asks the policy whether another attempt is allowed and waits the backoff
//! 3. opens a replacement through the connection factory and validates it
//! 4. replays the recorded calls, comparing cursor checksums as it goes
//!
//! then lets the failed call proceed on the replacement. Commit, rollback,
//! close and `set_auto_commit` end the recorded transaction.
//!
//! ## Locking
//!
//! The coordinator, each statement and each cursor sit behind their own
//! mutex. Locks are always taken in that order, and a statement proxy drops
//! its own lock before it asks the coordinator to recover.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlreplay_core::{
    sql_state, Connection, ConnectionFactory, Error, IsolationLevel, PreparedStatement, Result,
    Statement,
};
use sqlreplay_query::QueryProcessor;
use tracing::{debug, debug_span, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::execution::{Call, ExecutionLog, ExecutionRecord, HandleId};
use crate::listener::{RetryContext, RetryListener};
use crate::policy::RetryPolicy;
use crate::settings::ConnectionSettings;
use crate::statement::{
    RetryPreparedStatement, RetryStatement, SharedStatement, StatementDelegate, StatementState,
};

/// Lifecycle of the transaction on a retrying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Calls are being recorded
    Active,
    /// A retry loop is replacing the connection
    Recovering,
    /// The last transaction committed; the next call starts a new one
    Committed,
    /// The last transaction rolled back; the next call starts a new one
    RolledBack,
    /// The connection was closed; calls are forwarded without recording
    Closed,
}

/// A call on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCall {
    /// Create an ad-hoc statement
    CreateStatement,
    /// Prepare a statement; holds the text after rewriting
    PrepareStatement(String),
    /// Mark the connection read-only
    SetReadOnly(bool),
    /// Query the read-only flag
    IsReadOnly,
    /// Query the auto-commit flag
    AutoCommit,
    /// Set the isolation level
    SetIsolation(IsolationLevel),
    /// Query the isolation level
    Isolation,
    /// Commit
    Commit,
    /// Roll back
    Rollback,
    /// Close
    Close,
    /// Switch auto-commit
    SetAutoCommit(bool),
    /// Liveness probe
    IsValid(Duration),
}

impl Call for ConnectionCall {
    fn operation(&self) -> &'static str {
        match self {
            ConnectionCall::CreateStatement => "create_statement",
            ConnectionCall::PrepareStatement(_) => "prepare_statement",
            ConnectionCall::SetReadOnly(_) => "set_read_only",
            ConnectionCall::IsReadOnly => "is_read_only",
            ConnectionCall::AutoCommit => "auto_commit",
            ConnectionCall::SetIsolation(_) => "set_transaction_isolation",
            ConnectionCall::Isolation => "transaction_isolation",
            ConnectionCall::Commit => "commit",
            ConnectionCall::Rollback => "rollback",
            ConnectionCall::Close => "close",
            ConnectionCall::SetAutoCommit(_) => "set_auto_commit",
            ConnectionCall::IsValid(_) => "is_valid",
        }
    }

    fn arguments(&self) -> Vec<String> {
        match self {
            ConnectionCall::PrepareStatement(sql) => vec![format!("\"{}\"", sql)],
            ConnectionCall::SetReadOnly(b) | ConnectionCall::SetAutoCommit(b) => {
                vec![b.to_string()]
            }
            ConnectionCall::SetIsolation(level) => vec![level.to_string()],
            ConnectionCall::IsValid(timeout) => vec![format!("{:?}", timeout)],
            _ => Vec::new(),
        }
    }
}

/// Recorded result of a connection call
#[derive(Debug, Clone)]
pub(crate) enum ConnectionOutput {
    /// No result
    Unit,
    /// Boolean flag
    Bool(bool),
    /// Isolation level
    Isolation(IsolationLevel),
    /// Statement, shared with the proxy handed to the caller
    Statement(SharedStatement),
}

enum Returned {
    Unit,
    Bool(bool),
    Isolation(IsolationLevel),
    Statement(StatementDelegate),
}

fn invoke(delegate: &mut dyn Connection, call: &ConnectionCall) -> Result<Returned> {
    match call {
        ConnectionCall::CreateStatement => delegate
            .create_statement()
            .map(|stmt| Returned::Statement(StatementDelegate::Plain(stmt))),
        ConnectionCall::PrepareStatement(sql) => delegate
            .prepare_statement(sql)
            .map(|stmt| Returned::Statement(StatementDelegate::Prepared(stmt))),
        ConnectionCall::SetReadOnly(b) => delegate.set_read_only(*b).map(|_| Returned::Unit),
        ConnectionCall::IsReadOnly => delegate.is_read_only().map(Returned::Bool),
        ConnectionCall::AutoCommit => delegate.auto_commit().map(Returned::Bool),
        ConnectionCall::SetIsolation(level) => delegate
            .set_transaction_isolation(*level)
            .map(|_| Returned::Unit),
        ConnectionCall::Isolation => delegate.transaction_isolation().map(Returned::Isolation),
        ConnectionCall::Commit => delegate.commit().map(|_| Returned::Unit),
        ConnectionCall::Rollback => delegate.rollback().map(|_| Returned::Unit),
        ConnectionCall::Close => delegate.close().map(|_| Returned::Unit),
        ConnectionCall::SetAutoCommit(b) => delegate.set_auto_commit(*b).map(|_| Returned::Unit),
        ConnectionCall::IsValid(timeout) => delegate.is_valid(*timeout).map(Returned::Bool),
    }
}

type ConnectionRecord = ExecutionRecord<ConnectionCall, ConnectionOutput>;

/// Whether a record must survive the end of its transaction
///
/// Open statements outlive transactions, and so do the session flags set
/// through the connection.
fn is_session_scoped(record: &ConnectionRecord) -> bool {
    match (record.call(), record.outcome()) {
        (ConnectionCall::SetReadOnly(_), Ok(_)) | (ConnectionCall::SetIsolation(_), Ok(_)) => true,
        (_, Ok(ConnectionOutput::Statement(stmt))) => !stmt.lock().is_retired(),
        _ => false,
    }
}

/// Progress of one retry loop, carried across recoveries of one operation
#[derive(Debug)]
pub(crate) struct RetryLoop {
    trace_id: Uuid,
    operation: &'static str,
    started: Instant,
    attempt: u32,
}

impl RetryLoop {
    pub(crate) fn new(operation: &'static str) -> Self {
        RetryLoop {
            trace_id: Uuid::new_v4(),
            operation,
            started: Instant::now(),
            attempt: 1,
        }
    }
}

pub(crate) type SharedCoordinator = Arc<Mutex<Coordinator>>;

/// Owns the delegate connection and the transaction log
pub(crate) struct Coordinator {
    delegate: Box<dyn Connection>,
    id: HandleId,
    settings: ConnectionSettings,
    factory: Arc<dyn ConnectionFactory>,
    /// Records from finished transactions still needed to rebuild the session
    session: ExecutionLog<ConnectionCall, ConnectionOutput>,
    /// Records of the current transaction
    log: ExecutionLog<ConnectionCall, ConnectionOutput>,
    row_locking_override: Option<bool>,
    phase: Phase,
    cancel: CancelToken,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("session", &self.session.len())
            .field("calls", &self.log.len())
            .field("row_locking_override", &self.row_locking_override)
            .finish()
    }
}

impl Coordinator {
    fn new(
        delegate: Box<dyn Connection>,
        settings: ConnectionSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Coordinator {
            delegate,
            id: HandleId::next("connection"),
            settings,
            factory,
            session: ExecutionLog::new(),
            log: ExecutionLog::new(),
            row_locking_override: None,
            phase: Phase::Active,
            cancel: CancelToken::new(),
        }
    }

    fn recording(&self) -> bool {
        self.settings.retry_enabled() && self.phase != Phase::Closed
    }

    /// Called before every proxied call; a finished transaction is followed
    /// by a new one
    pub(crate) fn begin(&mut self) {
        if matches!(self.phase, Phase::Committed | Phase::RolledBack) {
            self.phase = Phase::Active;
        }
    }

    fn forward(&mut self, call: &ConnectionCall) -> (Result<Returned>, Duration) {
        let delegate = self.delegate.as_mut();
        self.settings
            .tracer()
            .run(self.id, call, || invoke(delegate, call))
    }

    /// Forward `call` and record its outcome
    fn record(&mut self, call: ConnectionCall) -> Result<ConnectionOutput> {
        self.begin();
        let (result, elapsed) = self.forward(&call);
        let recording = self.recording();
        let tracer = self.settings.tracer();
        let output = result.map(|returned| match returned {
            Returned::Unit => ConnectionOutput::Unit,
            Returned::Bool(b) => ConnectionOutput::Bool(b),
            Returned::Isolation(level) => ConnectionOutput::Isolation(level),
            Returned::Statement(stmt) => {
                ConnectionOutput::Statement(StatementState::new(stmt, recording, tracer).shared())
            }
        });
        if recording {
            self.log
                .push(ExecutionRecord::new(self.id, call, output.clone(), elapsed));
        }
        output
    }

    /// Forward `call` without recording it
    fn passthrough(&mut self, call: ConnectionCall) -> Result<()> {
        self.forward(&call).0.map(|_| ())
    }

    fn statement(&mut self, call: ConnectionCall) -> Result<SharedStatement> {
        match self.record(call)? {
            ConnectionOutput::Statement(stmt) => Ok(stmt),
            other => Err(Error::InvalidState(format!(
                "expected a statement, got {:?}",
                other
            ))),
        }
    }

    fn flag(&mut self, call: ConnectionCall) -> Result<bool> {
        match self.record(call)? {
            ConnectionOutput::Bool(b) => Ok(b),
            other => Err(Error::InvalidState(format!("expected a flag, got {:?}", other))),
        }
    }

    fn effective_processor(&self) -> &dyn QueryProcessor {
        match self.row_locking_override {
            Some(enabled) => sqlreplay_query::processor_for(enabled),
            None => self.settings.query_processor().as_ref(),
        }
    }

    /// Whether queries issued now get the row-locking rewrite
    pub(crate) fn row_locking(&self) -> bool {
        self.row_locking_override
            .unwrap_or_else(|| self.settings.implicit_row_locking())
    }

    /// Rewrite a query with the processor in effect for this transaction
    pub(crate) fn rewrite(&mut self, sql: &str) -> Result<String> {
        let read_only = self.delegate.is_read_only()?;
        let rewritten = self.effective_processor().process(read_only, sql);
        if rewritten != sql {
            debug!(target: "sqlreplay::retry", connection = %self.id, "Rewrote query for row locking");
        }
        Ok(rewritten)
    }

    /// Toggle row locking until the current transaction ends
    pub(crate) fn set_row_locking_override(&mut self, enabled: bool) -> Result<()> {
        if self.delegate.auto_commit()? {
            return Err(Error::InvalidState(
                "Implicit select-for-update requires explicit transactions (autoCommit=false)"
                    .to_string(),
            ));
        }
        debug!(target: "sqlreplay::retry", connection = %self.id, enabled, "Row locking toggled for this transaction");
        self.row_locking_override = Some(enabled);
        Ok(())
    }

    /// Move the transaction log aside, keeping what the session still needs
    fn discard_transaction(&mut self) {
        for record in self.log.take() {
            if !is_session_scoped(&record) {
                continue;
            }
            if !matches!(record.outcome(), Ok(ConnectionOutput::Statement(_))) {
                // only the latest value of a session flag matters
                let kind = mem::discriminant(record.call());
                self.session
                    .retain(|earlier| mem::discriminant(earlier.call()) != kind);
            }
            self.session.push(record);
        }
        self.session.retain(is_session_scoped);
        for record in self.session.iter() {
            if let Ok(ConnectionOutput::Statement(stmt)) = record.outcome() {
                stmt.lock().clear_history();
            }
        }
    }

    fn reset_row_locking(&mut self) {
        if self.row_locking_override.take().is_some() {
            debug!(target: "sqlreplay::retry", connection = %self.id, "Row locking reset to connection default");
        }
    }

    fn finish(&mut self, phase: Phase) {
        self.reset_row_locking();
        self.phase = phase;
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        if self.phase == Phase::Closed {
            return self.passthrough(ConnectionCall::Commit);
        }
        self.begin();
        let mut retry = RetryLoop::new("commit");
        loop {
            match self.passthrough(ConnectionCall::Commit) {
                Ok(()) => break,
                Err(cause) => self.recover(cause, &mut retry)?,
            }
        }
        self.discard_transaction();
        self.finish(Phase::Committed);
        Ok(())
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        if self.phase == Phase::Closed {
            return self.passthrough(ConnectionCall::Rollback);
        }
        self.discard_transaction();
        // the transaction is over even if the server call fails
        self.reset_row_locking();
        self.passthrough(ConnectionCall::Rollback)?;
        self.finish(Phase::RolledBack);
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.log.clear();
        self.session.clear();
        self.reset_row_locking();
        self.passthrough(ConnectionCall::Close)?;
        self.finish(Phase::Closed);
        Ok(())
    }

    pub(crate) fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        if self.phase != Phase::Closed {
            self.discard_transaction();
        }
        self.passthrough(ConnectionCall::SetAutoCommit(auto_commit))
    }

    /// Recover from `cause` by replaying the transaction onto a new connection
    ///
    /// Returns `Err(cause)` untouched when the error is not retryable or
    /// retries are off. On success `retry` points at the next attempt and the
    /// failed operation may be re-issued.
    pub(crate) fn recover(&mut self, cause: Error, retry: &mut RetryLoop) -> Result<()> {
        let policy = self.settings.retry_policy().clone();
        if !self.settings.retry_enabled() || self.phase == Phase::Closed || !policy.is_retryable(&cause)
        {
            return Err(cause);
        }
        let listener = self.settings.retry_listener().clone();
        let span = debug_span!(
            target: "sqlreplay::retry",
            "retry",
            trace_id = %retry.trace_id,
            operation = retry.operation
        );
        let _guard = span.enter();

        debug!(
            target: "sqlreplay::retry",
            attempt = retry.attempt,
            error = %cause,
            "Entering retry attempt due to transient error"
        );
        self.phase = Phase::Recovering;
        let result = self.retry_loop(cause, retry, policy.as_ref(), listener.as_ref());
        if self.phase == Phase::Recovering {
            self.phase = Phase::Active;
        }
        result
    }

    fn retry_loop(
        &mut self,
        cause: Error,
        retry: &mut RetryLoop,
        policy: &dyn RetryPolicy,
        listener: &dyn RetryListener,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.close_delegate() {
                if !policy.is_connection_error(&e) {
                    return Err(Error::Rollback {
                        source: Box::new(e),
                    });
                }
                warn!(target: "sqlreplay::retry", connection = %self.id, error = %e, "Connection error on rollback before retry");
            }

            if !policy.should_continue(retry.attempt, retry.started) {
                return Err(Error::TooManyRetries {
                    attempts: retry.attempt,
                    policy: policy.description(),
                    source: Box::new(cause),
                });
            }

            let backoff = policy.backoff(retry.attempt);
            let mut ctx = RetryContext {
                trace_id: retry.trace_id,
                operation: retry.operation,
                attempt: retry.attempt,
                started: retry.started,
                last_error: cause.clone(),
                connection: self.id,
            };
            listener.before_retry(&ctx, backoff);
            debug!(target: "sqlreplay::retry", attempt = retry.attempt, backoff = ?backoff, "Waiting before retry");

            if self.cancel.wait(backoff) {
                let err = Error::Interrupted {
                    source: Box::new(cause),
                };
                listener.after_retry(&ctx, Some(&err), retry.started.elapsed());
                return Err(err);
            }

            let outcome = self.open_delegate().and_then(|()| self.replay());
            ctx.connection = self.id;
            listener.after_retry(&ctx, outcome.as_ref().err(), retry.started.elapsed());

            match outcome {
                Ok(()) => {
                    debug!(target: "sqlreplay::retry", attempt = retry.attempt, connection = %self.id, "Replay succeeded");
                    retry.attempt += 1;
                    return Ok(());
                }
                Err(Error::ConcurrentUpdate) => return Err(Error::ConcurrentUpdate),
                Err(e) if policy.is_retryable(&e) || policy.is_connection_error(&e) => {
                    debug!(target: "sqlreplay::retry", attempt = retry.attempt, error = %e, "Transient error during replay");
                    retry.attempt += 1;
                }
                Err(e) => {
                    return Err(Error::RetryFailed {
                        attempt: retry.attempt,
                        source: Box::new(e),
                        cause: Box::new(cause),
                    });
                }
            }
        }
    }

    fn close_delegate(&mut self) -> Result<()> {
        if self.delegate.is_closed()? {
            debug!(target: "sqlreplay::retry", connection = %self.id, "Connection already closed");
            return Ok(());
        }
        log_warnings(self.delegate.as_ref(), self.id);
        debug!(target: "sqlreplay::retry", connection = %self.id, "Rolling back and closing connection");
        self.delegate.rollback()?;
        self.delegate.close()
    }

    fn open_delegate(&mut self) -> Result<()> {
        let mut candidate = self.factory.connect()?;
        if let Err(e) = self.validate(candidate.as_mut()) {
            if let Err(close_err) = candidate.close() {
                debug!(target: "sqlreplay::retry", error = %close_err, "Could not close rejected connection");
            }
            return Err(e);
        }
        let previous = self.id;
        self.delegate = candidate;
        self.id = HandleId::next("connection");
        log_warnings(self.delegate.as_ref(), self.id);
        debug!(target: "sqlreplay::retry", connection = %self.id, replaced = %previous, "Opened replacement connection");
        Ok(())
    }

    fn validate(&self, candidate: &mut dyn Connection) -> Result<()> {
        if candidate.auto_commit()? {
            return Err(Error::sql(
                sql_state::UNEXPECTED_ERROR,
                "Connection is in auto-commit mode",
            ));
        }
        if !candidate.is_valid(self.settings.validation_timeout())? {
            return Err(Error::invalid_connection(
                "Connection is invalid",
                sql_state::CONNECTION_UNABLE_TO_CONNECT,
            ));
        }
        Ok(())
    }

    fn replay(&mut self) -> Result<()> {
        debug!(
            target: "sqlreplay::retry",
            connection = %self.id,
            session = self.session.len(),
            calls = self.log.len(),
            "Repeating calls:{}",
            self.log.summary()
        );
        let tracer = self.settings.tracer();
        let id = self.id;
        let delegate = self.delegate.as_mut();
        for log in [&mut self.session, &mut self.log] {
            for record in log.iter_mut() {
                if !record.succeeded() {
                    continue;
                }
                let call = record.call();
                let (result, elapsed) = tracer.run(id, call, || invoke(&mut *delegate, call));
                let output = match result? {
                    Returned::Statement(stmt) => {
                        match record.outcome() {
                            Ok(ConnectionOutput::Statement(shared)) => shared.lock().replay(stmt)?,
                            _ => {
                                return Err(Error::InvalidState(
                                    "replayed call produced a statement".to_string(),
                                ))
                            }
                        }
                        continue;
                    }
                    Returned::Unit => ConnectionOutput::Unit,
                    Returned::Bool(b) => ConnectionOutput::Bool(b),
                    Returned::Isolation(level) => ConnectionOutput::Isolation(level),
                };
                record.replace_result(id, output, elapsed);
            }
        }
        Ok(())
    }
}

fn log_warnings(connection: &dyn Connection, id: HandleId) {
    match connection.warnings() {
        Ok(warnings) if !warnings.is_empty() => {
            warn!(target: "sqlreplay::retry", connection = %id, ?warnings, "Connection reported warnings");
        }
        Ok(_) => {}
        Err(e) => {
            debug!(target: "sqlreplay::retry", connection = %id, error = %e, "Could not read connection warnings");
        }
    }
}

/// Connection proxy that transparently retries failed transactions
///
/// Statements created through it are proxies too; dropping one removes it
/// from the session once the current transaction ends.
pub struct RetryConnection {
    coordinator: SharedCoordinator,
    cancel: CancelToken,
}

impl RetryConnection {
    /// Wrap `delegate`; replacements are opened through `factory`
    pub fn new(
        delegate: Box<dyn Connection>,
        settings: ConnectionSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let coordinator = Coordinator::new(delegate, settings, factory);
        let cancel = coordinator.cancel.clone();
        RetryConnection {
            coordinator: Arc::new(Mutex::new(coordinator)),
            cancel,
        }
    }

    /// Number of calls recorded for the current transaction
    pub fn history_len(&self) -> usize {
        self.coordinator.lock().log.len()
    }

    /// Current transaction phase
    pub fn phase(&self) -> Phase {
        self.coordinator.lock().phase
    }

    /// Token that interrupts a retry waiting out its backoff
    ///
    /// Usable from another thread while this connection is blocked in a retry.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether queries currently get the row-locking rewrite
    pub fn row_locking(&self) -> bool {
        self.coordinator.lock().row_locking()
    }

    /// Identity of the physical connection currently in use
    pub fn connection_id(&self) -> HandleId {
        self.coordinator.lock().id
    }

    /// Like [`Connection::create_statement`], without boxing the proxy
    pub fn create_retry_statement(&mut self) -> Result<RetryStatement> {
        let state = self
            .coordinator
            .lock()
            .statement(ConnectionCall::CreateStatement)?;
        Ok(RetryStatement::new(self.coordinator.clone(), state))
    }

    /// Like [`Connection::prepare_statement`], without boxing the proxy
    pub fn prepare_retry_statement(&mut self, sql: &str) -> Result<RetryPreparedStatement> {
        let state = {
            let mut coordinator = self.coordinator.lock();
            let sql = coordinator.rewrite(sql)?;
            coordinator.statement(ConnectionCall::PrepareStatement(sql))?
        };
        Ok(RetryPreparedStatement::new(self.coordinator.clone(), state))
    }
}

impl fmt::Debug for RetryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryConnection")
            .field(&*self.coordinator.lock())
            .finish()
    }
}

impl Connection for RetryConnection {
    fn create_statement(&mut self) -> Result<Box<dyn Statement>> {
        Ok(Box::new(self.create_retry_statement()?))
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        Ok(Box::new(self.prepare_retry_statement(sql)?))
    }

    fn commit(&mut self) -> Result<()> {
        self.coordinator.lock().commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.coordinator.lock().rollback()
    }

    fn close(&mut self) -> Result<()> {
        self.coordinator.lock().close()
    }

    fn is_closed(&self) -> Result<bool> {
        self.coordinator.lock().delegate.is_closed()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.coordinator.lock().set_auto_commit(auto_commit)
    }

    fn auto_commit(&self) -> Result<bool> {
        self.coordinator.lock().flag(ConnectionCall::AutoCommit)
    }

    fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.coordinator
            .lock()
            .record(ConnectionCall::SetReadOnly(read_only))
            .map(|_| ())
    }

    fn is_read_only(&self) -> Result<bool> {
        self.coordinator.lock().flag(ConnectionCall::IsReadOnly)
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.coordinator
            .lock()
            .record(ConnectionCall::SetIsolation(level))
            .map(|_| ())
    }

    fn transaction_isolation(&self) -> Result<IsolationLevel> {
        match self.coordinator.lock().record(ConnectionCall::Isolation)? {
            ConnectionOutput::Isolation(level) => Ok(level),
            other => Err(Error::InvalidState(format!(
                "expected an isolation level, got {:?}",
                other
            ))),
        }
    }

    fn is_valid(&mut self, timeout: Duration) -> Result<bool> {
        let mut coordinator = self.coordinator.lock();
        match coordinator.forward(&ConnectionCall::IsValid(timeout)).0? {
            Returned::Bool(b) => Ok(b),
            _ => Err(Error::InvalidState("is_valid returned no flag".to_string())),
        }
    }

    fn warnings(&self) -> Result<Vec<String>> {
        self.coordinator.lock().delegate.warnings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ExponentialBackoffPolicy;
    use sqlreplay_core::testing::{MockDatabase, Op};

    fn settings() -> ConnectionSettings {
        ConnectionSettings::new().with_retry_policy(Arc::new(
            ExponentialBackoffPolicy::new()
                .with_max_attempts(5)
                .with_multiplier(1.0)
                .with_jitter(Duration::ZERO)
                .with_max_backoff(Duration::from_millis(1)),
        ))
    }

    fn connect(db: &MockDatabase, settings: ConnectionSettings) -> RetryConnection {
        RetryConnection::new(
            Box::new(db.connect().unwrap()),
            settings,
            Arc::new(db.factory()),
        )
    }

    #[test]
    fn test_phase_follows_transaction() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        assert_eq!(conn.phase(), Phase::Active);
        conn.set_read_only(false).unwrap();
        conn.commit().unwrap();
        assert_eq!(conn.phase(), Phase::Committed);
        conn.auto_commit().unwrap();
        assert_eq!(conn.phase(), Phase::Active);
        conn.rollback().unwrap();
        assert_eq!(conn.phase(), Phase::RolledBack);
        conn.close().unwrap();
        assert_eq!(conn.phase(), Phase::Closed);
    }

    #[test]
    fn test_commit_clears_history() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        conn.is_read_only().unwrap();
        conn.auto_commit().unwrap();
        assert_eq!(conn.history_len(), 2);
        conn.commit().unwrap();
        assert_eq!(conn.history_len(), 0);
    }

    #[test]
    fn test_commit_failure_replays_on_new_connection() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        let before = conn.connection_id();
        conn.set_read_only(false).unwrap();
        db.fail_times(Op::Commit, 1, Error::serialization_failure("restart transaction"));

        conn.commit().unwrap();
        assert_eq!(db.connections_opened(), 2);
        assert_ne!(conn.connection_id(), before);
        assert_eq!(db.calls(Op::Commit), 2);
    }

    #[test]
    fn test_too_many_retries() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        db.fail(Op::Commit, Error::serialization_failure("restart transaction"));

        let err = conn.commit().unwrap_err();
        match err {
            Error::TooManyRetries { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("unexpected error: {other:?}"),
        }
        // one initial connection plus five replacements
        assert_eq!(db.connections_opened(), 6);
    }

    #[test]
    fn test_non_retryable_error_is_surfaced() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        db.fail_times(Op::Commit, 1, Error::sql("23505", "duplicate key"));
        let err = conn.commit().unwrap_err();
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(db.connections_opened(), 1);
    }

    #[test]
    fn test_retry_disabled_surfaces_error() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings().with_retry_enabled(false));
        conn.is_read_only().unwrap();
        assert_eq!(conn.history_len(), 0);
        db.fail_times(Op::Commit, 1, Error::serialization_failure("restart"));
        assert!(conn.commit().unwrap_err().is_serialization_failure());
    }

    #[test]
    fn test_auto_commit_replacement_is_rejected() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        db.set_auto_commit_on_connect(true);
        db.fail_times(Op::Commit, 1, Error::serialization_failure("restart"));
        match conn.commit().unwrap_err() {
            Error::RetryFailed { source, .. } => {
                assert_eq!(source.sql_state(), Some(sql_state::UNEXPECTED_ERROR))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rollback_failure_aborts_retry() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        db.fail_times(Op::Commit, 1, Error::serialization_failure("restart"));
        db.fail_times(Op::Rollback, 1, Error::sql("XX000", "internal"));
        assert!(matches!(conn.commit().unwrap_err(), Error::Rollback { .. }));
    }

    #[test]
    fn test_toggle_requires_explicit_transaction() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        conn.set_auto_commit(true).unwrap();
        let err = conn
            .coordinator
            .lock()
            .set_row_locking_override(true)
            .unwrap_err();
        assert_eq!(err.sql_state(), Some(sql_state::INVALID_TRANSACTION_STATE));
    }

    #[test]
    fn test_toggle_resets_at_transaction_end() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());
        assert!(!conn.row_locking());
        conn.coordinator.lock().set_row_locking_override(true).unwrap();
        assert!(conn.row_locking());
        conn.commit().unwrap();
        assert!(!conn.row_locking());
    }

    #[test]
    fn test_toggle_resets_when_rollback_or_close_fails() {
        let db = MockDatabase::new();
        let mut conn = connect(&db, settings());

        conn.coordinator.lock().set_row_locking_override(true).unwrap();
        db.fail_times(Op::Rollback, 1, Error::sql(sql_state::UNEXPECTED_ERROR, "rollback failed"));
        assert!(conn.rollback().is_err());
        assert!(!conn.row_locking());

        conn.coordinator.lock().set_row_locking_override(true).unwrap();
        db.fail_times(Op::Close, 1, Error::sql(sql_state::UNEXPECTED_ERROR, "close failed"));
        assert!(conn.close().is_err());
        assert!(!conn.row_locking());
    }

    #[test]
    fn test_cancel_interrupts_backoff() {
        let db = MockDatabase::new();
        let policy = ExponentialBackoffPolicy::new()
            .with_jitter(Duration::ZERO)
            .with_max_backoff(Duration::from_secs(60));
        let mut conn = connect(&db, settings().with_retry_policy(Arc::new(policy)));
        conn.cancel_token().cancel();
        db.fail_times(Op::Commit, 1, Error::serialization_failure("restart"));
        assert!(matches!(conn.commit().unwrap_err(), Error::Interrupted { .. }));
    }
}
