//! Transaction retry layer for sqlreplay
//!
//! This crate wraps driver handles in recording proxies:
//! - RetryConnection: records connection calls, owns the retry loop
//! - RetryStatement / RetryPreparedStatement: record statement calls and
//!   rewrite queries for implicit row locking
//! - RetryResultSet: folds every value read into a checksum
//!
//! When a transaction fails with a retryable error, the retry loop opens a
//! fresh connection, replays the recorded calls and compares the checksum of
//! every cursor. Identical data means the caller can carry on as if nothing
//! happened; different data fails with a concurrent-update error.
//!
//! Supporting pieces:
//! - Checksum: SHA-256 folding of cursor values and streams
//! - ExecutionLog: ordered call records with replaceable outcomes
//! - RetryPolicy: retryable-error classification and backoff
//! - RetryListener: observation of retry attempts
//! - CallTracer: optional per-call trace logging

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod checksum;
pub mod connection;
pub mod execution;
pub mod listener;
pub mod policy;
pub mod result;
pub mod settings;
pub mod statement;
pub mod trace;

pub use cancel::CancelToken;
pub use checksum::{Checksum, ChecksumReader};
pub use connection::{ConnectionCall, Phase, RetryConnection};
pub use execution::{Call, ExecutionLog, ExecutionRecord, HandleId};
pub use listener::{LoggingRetryListener, NoopRetryListener, RetryContext, RetryListener};
pub use policy::{
    ExponentialBackoffPolicy, NeverRetry, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
};
pub use result::{CursorCall, CursorOutput, RetryResultSet};
pub use settings::{ConnectionSettings, DEFAULT_VALIDATION_TIMEOUT};
pub use statement::{RetryPreparedStatement, RetryStatement, StatementCall};
pub use trace::CallTracer;
