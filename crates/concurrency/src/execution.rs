//! Execution records
//!
//! Every intercepted call that completed (successfully or not) is kept as an
//! `ExecutionRecord` in the log of the proxy that issued it. Records are
//! appended strictly after the delegate returned, so the log never holds a
//! call with an unknown outcome.
//!
//! A record is immutable except for its outcome, which a replay overwrites
//! with the value the replacement delegate returned.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sqlreplay_core::{Error, Result};

/// Process-wide counter for handle identities
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identity of one physical driver handle
///
/// A fresh identity is issued each time a delegate is wrapped or replaced,
/// so log lines show which physical handle served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    kind: &'static str,
    seq: u64,
}

impl HandleId {
    /// Issue a new identity for a handle of the given kind
    pub fn next(kind: &'static str) -> Self {
        HandleId {
            kind,
            seq: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Handle kind, e.g. `connection`
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.kind, self.seq)
    }
}

/// An intercepted call: operation name plus arguments
pub trait Call: fmt::Debug {
    /// Operation name, e.g. `execute_query`
    fn operation(&self) -> &'static str;

    /// Arguments rendered for logs
    fn arguments(&self) -> Vec<String> {
        Vec::new()
    }
}

/// One completed call against a delegate
#[derive(Debug)]
pub struct ExecutionRecord<C, O> {
    target: HandleId,
    call: C,
    outcome: Result<O>,
    duration: Duration,
}

impl<C: Call, O> ExecutionRecord<C, O> {
    /// Record a completed call
    pub fn new(target: HandleId, call: C, outcome: Result<O>, duration: Duration) -> Self {
        ExecutionRecord {
            target,
            call,
            outcome,
            duration,
        }
    }

    /// Handle the call was issued against
    pub fn target(&self) -> HandleId {
        self.target
    }

    /// The call
    pub fn call(&self) -> &C {
        &self.call
    }

    /// Result or error of the call
    pub fn outcome(&self) -> &Result<O> {
        &self.outcome
    }

    /// Whether the call succeeded
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Error of the call, if it failed
    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }

    /// Wall-clock time the delegate took
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Overwrite the outcome after a replay re-executed the call
    pub fn replace_result(&mut self, target: HandleId, result: O, duration: Duration) {
        self.target = target;
        self.outcome = Ok(result);
        self.duration = duration;
    }
}

/// Ordered log of execution records for one proxy
#[derive(Debug)]
pub struct ExecutionLog<C, O> {
    records: Vec<ExecutionRecord<C, O>>,
}

impl<C, O> Default for ExecutionLog<C, O> {
    fn default() -> Self {
        ExecutionLog {
            records: Vec::new(),
        }
    }
}

/// Number of calls listed in a call-stack summary
const SUMMARY_LIMIT: usize = 5;

impl<C: Call, O> ExecutionLog<C, O> {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&mut self, record: ExecutionRecord<C, O>) {
        self.records.push(record);
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Keep only the records matching `keep`
    pub fn retain(&mut self, keep: impl FnMut(&ExecutionRecord<C, O>) -> bool) {
        self.records.retain(keep);
    }

    /// Move every record out, leaving the log empty
    pub fn take(&mut self) -> Vec<ExecutionRecord<C, O>> {
        std::mem::take(&mut self.records)
    }

    /// Records in call order
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionRecord<C, O>> {
        self.records.iter()
    }

    /// Mutable records in call order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExecutionRecord<C, O>> {
        self.records.iter_mut()
    }

    /// Short listing of the recorded calls for debug logs
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (i, record) in self.records.iter().take(SUMMARY_LIMIT).enumerate() {
            out.push_str(&format!("\n\t[{}] {}", i, record.call.operation()));
        }
        if self.records.len() > SUMMARY_LIMIT {
            out.push_str(&format!(
                "\n\t(truncated at {} but there are {} calls queued in total)",
                SUMMARY_LIMIT,
                self.records.len()
            ));
        }
        out
    }
}
