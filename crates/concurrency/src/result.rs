//! Cursor proxy
//!
//! Every value read through a [`RetryResultSet`] is folded into a running
//! checksum before it reaches the caller. When the owning transaction is
//! replayed, the cursor calls are re-issued against the new result set into a
//! fresh checksum; the two digests must agree or the replay fails with
//! [`Error::ConcurrentUpdate`].
//!
//! Folding rules:
//! - `next` and `was_null` fold their boolean as `"true"`/`"false"`
//! - `get` folds the value (see [`Checksum::fold`])
//! - streams fold every byte the caller actually reads
//! - `column_names` and `close` fold nothing

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlreplay_core::{Column, Error, ResultSet, Result, StreamKind, Value};

use crate::checksum::{drain, Checksum, ChecksumReader, SharedChecksum};
use crate::execution::{Call, ExecutionLog, ExecutionRecord, HandleId};
use crate::trace::CallTracer;

/// A call on a cursor
#[derive(Debug, Clone, PartialEq)]
pub enum CursorCall {
    /// Advance to the next row
    Next,
    /// Read a column value
    Get(Column),
    /// Open a column as a byte stream
    GetStream(Column, StreamKind),
    /// Whether the last read value was NULL
    WasNull,
    /// Column labels
    ColumnNames,
    /// Release the cursor
    Close,
}

impl Call for CursorCall {
    fn operation(&self) -> &'static str {
        match self {
            CursorCall::Next => "next",
            CursorCall::Get(_) => "get",
            CursorCall::GetStream(..) => "get_stream",
            CursorCall::WasNull => "was_null",
            CursorCall::ColumnNames => "column_names",
            CursorCall::Close => "close",
        }
    }

    fn arguments(&self) -> Vec<String> {
        match self {
            CursorCall::Get(column) => vec![column.to_string()],
            CursorCall::GetStream(column, kind) => vec![column.to_string(), format!("{:?}", kind)],
            _ => Vec::new(),
        }
    }
}

/// Recorded result of a cursor call
///
/// Streams are not kept; their bytes live on only in the checksum.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorOutput {
    /// No result
    Unit,
    /// Boolean result of `next` or `was_null`
    Bool(bool),
    /// Column value
    Value(Value),
    /// A stream was handed out
    Stream,
    /// Column labels
    Columns(Vec<String>),
}

/// What the delegate returned, before recording
pub(crate) enum Returned {
    Unit,
    Bool(bool),
    Value(Value),
    Stream(Box<dyn Read + Send>),
    Columns(Vec<String>),
}

impl Returned {
    fn kind(&self) -> &'static str {
        match self {
            Returned::Unit => "unit",
            Returned::Bool(_) => "bool",
            Returned::Value(_) => "value",
            Returned::Stream(_) => "stream",
            Returned::Columns(_) => "columns",
        }
    }

    fn mismatch(self, expected: &str) -> Error {
        Error::InvalidState(format!(
            "cursor call returned {} where {} was expected",
            self.kind(),
            expected
        ))
    }

    fn into_unit(self) -> Result<()> {
        match self {
            Returned::Unit => Ok(()),
            other => Err(other.mismatch("unit")),
        }
    }

    fn into_bool(self) -> Result<bool> {
        match self {
            Returned::Bool(b) => Ok(b),
            other => Err(other.mismatch("bool")),
        }
    }

    fn into_value(self) -> Result<Value> {
        match self {
            Returned::Value(v) => Ok(v),
            other => Err(other.mismatch("value")),
        }
    }

    fn into_stream(self) -> Result<Box<dyn Read + Send>> {
        match self {
            Returned::Stream(s) => Ok(s),
            other => Err(other.mismatch("stream")),
        }
    }

    fn into_columns(self) -> Result<Vec<String>> {
        match self {
            Returned::Columns(c) => Ok(c),
            other => Err(other.mismatch("columns")),
        }
    }
}

/// Cursor state shared between a [`RetryResultSet`] and the statement log
/// entry that produced it
pub(crate) type SharedCursor = Arc<Mutex<CursorState>>;

pub(crate) struct CursorState {
    id: HandleId,
    delegate: Box<dyn ResultSet>,
    log: ExecutionLog<CursorCall, CursorOutput>,
    checksum: SharedChecksum,
    recording: bool,
    tracer: CallTracer,
}

impl fmt::Debug for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorState")
            .field("id", &self.id)
            .field("calls", &self.log.len())
            .field("recording", &self.recording)
            .finish()
    }
}

impl CursorState {
    pub(crate) fn new(delegate: Box<dyn ResultSet>, recording: bool, tracer: CallTracer) -> Self {
        CursorState {
            id: HandleId::next("result_set"),
            delegate,
            log: ExecutionLog::new(),
            checksum: Arc::new(Mutex::new(Checksum::new())),
            recording,
            tracer,
        }
    }

    pub(crate) fn shared(self) -> SharedCursor {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    /// Digest of everything read so far
    pub(crate) fn digest(&self) -> Vec<u8> {
        self.checksum.lock().digest()
    }

    fn invoke(delegate: &mut dyn ResultSet, call: &CursorCall) -> Result<Returned> {
        match call {
            CursorCall::Next => delegate.next().map(Returned::Bool),
            CursorCall::Get(column) => delegate.get(column).map(Returned::Value),
            CursorCall::GetStream(column, kind) => {
                delegate.get_stream(column, *kind).map(Returned::Stream)
            }
            CursorCall::WasNull => delegate.was_null().map(Returned::Bool),
            CursorCall::ColumnNames => delegate.column_names().map(Returned::Columns),
            CursorCall::Close => delegate.close().map(|_| Returned::Unit),
        }
    }

    /// Forward `call`, folding and recording its result
    pub(crate) fn call(&mut self, call: CursorCall) -> Result<Returned> {
        let delegate = self.delegate.as_mut();
        let (result, elapsed) = self
            .tracer
            .run(self.id, &call, || Self::invoke(delegate, &call));
        if !self.recording {
            return result;
        }
        let returned = match result {
            Ok(returned) => returned,
            Err(e) => {
                self.log
                    .push(ExecutionRecord::new(self.id, call, Err(e.clone()), elapsed));
                return Err(e);
            }
        };
        let (recorded, returned) = match returned {
            Returned::Unit => (CursorOutput::Unit, Returned::Unit),
            Returned::Bool(b) => {
                self.checksum.lock().fold_bool(b);
                (CursorOutput::Bool(b), Returned::Bool(b))
            }
            Returned::Value(v) => {
                self.checksum.lock().fold(&v);
                (CursorOutput::Value(v.clone()), Returned::Value(v))
            }
            Returned::Stream(inner) => {
                let reader = ChecksumReader::new(inner, self.checksum.clone());
                (CursorOutput::Stream, Returned::Stream(Box::new(reader)))
            }
            Returned::Columns(c) => (CursorOutput::Columns(c.clone()), Returned::Columns(c)),
        };
        self.log
            .push(ExecutionRecord::new(self.id, call, Ok(recorded), elapsed));
        Ok(returned)
    }

    /// Re-issue every successful call against `delegate` and compare digests
    ///
    /// Streams are drained in full, so a stream the caller only partly read
    /// before the failure never matches.
    pub(crate) fn replay(&mut self, delegate: Box<dyn ResultSet>) -> Result<()> {
        self.delegate = delegate;
        self.id = HandleId::next("result_set");
        let replayed: SharedChecksum = Arc::new(Mutex::new(Checksum::new()));
        let id = self.id;
        let tracer = self.tracer;
        let delegate = self.delegate.as_mut();

        for record in self.log.iter_mut() {
            if !record.succeeded() {
                continue;
            }
            let call = record.call();
            let (result, elapsed) = tracer.run(id, call, || Self::invoke(&mut *delegate, call));
            let recorded = match result? {
                Returned::Unit => CursorOutput::Unit,
                Returned::Bool(b) => {
                    replayed.lock().fold_bool(b);
                    CursorOutput::Bool(b)
                }
                Returned::Value(v) => {
                    replayed.lock().fold(&v);
                    CursorOutput::Value(v)
                }
                Returned::Stream(inner) => {
                    let mut reader = ChecksumReader::new(inner, replayed.clone());
                    drain(&mut reader)?;
                    CursorOutput::Stream
                }
                Returned::Columns(c) => CursorOutput::Columns(c),
            };
            record.replace_result(id, recorded, elapsed);
        }

        if self.checksum.lock().digest() != replayed.lock().digest() {
            return Err(Error::ConcurrentUpdate);
        }
        Ok(())
    }
}

/// Result set proxy handed out by retrying statements
pub struct RetryResultSet {
    state: SharedCursor,
}

impl RetryResultSet {
    pub(crate) fn new(state: SharedCursor) -> Self {
        RetryResultSet { state }
    }

    /// Identity of the physical result set currently behind this proxy
    pub fn handle_id(&self) -> HandleId {
        self.state.lock().id()
    }

    /// Digest of every value read so far
    pub fn checksum(&self) -> Vec<u8> {
        self.state.lock().digest()
    }

    fn call(&mut self, call: CursorCall) -> Result<Returned> {
        self.state.lock().call(call)
    }
}

impl fmt::Debug for RetryResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryResultSet").field(&*self.state.lock()).finish()
    }
}

impl ResultSet for RetryResultSet {
    fn next(&mut self) -> Result<bool> {
        self.call(CursorCall::Next)?.into_bool()
    }

    fn get(&mut self, column: &Column) -> Result<Value> {
        self.call(CursorCall::Get(column.clone()))?.into_value()
    }

    fn get_stream(&mut self, column: &Column, kind: StreamKind) -> Result<Box<dyn Read + Send>> {
        self.call(CursorCall::GetStream(column.clone(), kind))?
            .into_stream()
    }

    fn was_null(&mut self) -> Result<bool> {
        self.call(CursorCall::WasNull)?.into_bool()
    }

    fn column_names(&mut self) -> Result<Vec<String>> {
        self.call(CursorCall::ColumnNames)?.into_columns()
    }

    fn close(&mut self) -> Result<()> {
        self.call(CursorCall::Close)?.into_unit()
    }
}
