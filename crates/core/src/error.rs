//! Error types for sqlreplay
//!
//! One error enum is shared by the driver traits and the retry layer, so a
//! retrying proxy can be handed out wherever a plain driver handle is expected.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Only [`Error::Sql`] values (errors reported by the database or the client
//! driver) carry a classifiable SQL state. Everything else is produced by the
//! retry layer itself and is terminal.

use std::io;
use thiserror::Error;

/// Result type alias for sqlreplay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Well-known SQL state codes
///
/// Five-character codes as reported by PostgreSQL-compatible servers.
pub mod sql_state {
    /// Serializable transaction could not be placed in a valid serial order
    pub const SERIALIZATION_FAILURE: &str = "40001";
    /// Client could not establish a connection
    pub const CONNECTION_UNABLE_TO_CONNECT: &str = "08001";
    /// Connection does not exist (closed or never opened)
    pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
    /// Server rejected the connection
    pub const CONNECTION_REJECTED: &str = "08004";
    /// Connection failure
    pub const CONNECTION_FAILURE: &str = "08006";
    /// Connection failed while a transaction was in progress
    pub const CONNECTION_FAILURE_DURING_TRANSACTION: &str = "08007";
    /// Communication link failure
    pub const COMMUNICATION_ERROR: &str = "08S01";
    /// Server is not accepting new transactions on existing connections
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    /// A parameter value is missing or unusable
    pub const INVALID_PARAMETER_VALUE: &str = "22023";
    /// Operation not valid in the current transaction state
    pub const INVALID_TRANSACTION_STATE: &str = "25000";
    /// Catch-all for errors with no better classification
    pub const UNEXPECTED_ERROR: &str = "XX000";
    /// Feature not supported by this driver
    pub const NOT_IMPLEMENTED: &str = "0A000";

    /// Codes that denote a broken or unusable connection
    pub const CONNECTION_ERRORS: &[&str] = &[
        CONNECTION_UNABLE_TO_CONNECT,
        CONNECTION_DOES_NOT_EXIST,
        CONNECTION_REJECTED,
        CONNECTION_FAILURE,
        CONNECTION_FAILURE_DURING_TRANSACTION,
        COMMUNICATION_ERROR,
        ADMIN_SHUTDOWN,
    ];
}

/// Error types for sqlreplay
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Error reported by the database or the underlying client driver
    #[error("{message} (SQL state {state})")]
    Sql {
        /// Five-character SQL state
        state: String,
        /// Driver message
        message: String,
    },

    /// A replay executed successfully but observed different data
    #[error("the transaction could not serialize due to a concurrent update (checksum failure)")]
    ConcurrentUpdate,

    /// Rolling back the poisoned handle failed with a non-connection error
    #[error("exception on rollback before retry: {source}")]
    Rollback {
        /// The rollback failure
        source: Box<Error>,
    },

    /// The retry policy refused another attempt
    #[error("too many retry attempts [{attempts}] or other limit in [{policy}]")]
    TooManyRetries {
        /// Attempt number at which the budget ran out
        attempts: u32,
        /// Description of the policy that refused
        policy: String,
        /// The original retryable error
        source: Box<Error>,
    },

    /// Opening, validating or replaying onto a replacement handle failed
    /// with an error that is not retryable
    #[error("retry attempt [{attempt}] failed: {source} (original cause: {cause})")]
    RetryFailed {
        /// Attempt number that failed
        attempt: u32,
        /// The failure observed during the attempt
        source: Box<Error>,
        /// The original retryable error that started the retry loop
        cause: Box<Error>,
    },

    /// Cancellation was observed while waiting to retry
    #[error("retry interrupted while waiting: {source}")]
    Interrupted {
        /// The original retryable error
        source: Box<Error>,
    },

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error while reading a streamed value
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Kind of the underlying I/O error
        kind: io::ErrorKind,
        /// Message of the underlying I/O error
        message: String,
    },
}

impl Error {
    /// Create an error carrying a SQL state, as a driver would report it
    pub fn sql(state: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Sql {
            state: state.into(),
            message: message.into(),
        }
    }

    /// Serialization conflict (`40001`)
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::sql(sql_state::SERIALIZATION_FAILURE, message)
    }

    /// Handle failed validation or could not be used (`08001` family)
    pub fn invalid_connection(message: impl Into<String>, state: &str) -> Self {
        Self::sql(state, message)
    }

    /// SQL state of this error, if any
    ///
    /// Derived errors report the state of the error they wrap, so callers
    /// that only look at codes see the same picture as the database gave.
    /// A checksum mismatch reports a serialization failure.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Sql { state, .. } => Some(state.as_str()),
            Error::ConcurrentUpdate => Some(sql_state::SERIALIZATION_FAILURE),
            Error::Rollback { source }
            | Error::TooManyRetries { source, .. }
            | Error::Interrupted { source } => source.sql_state(),
            Error::RetryFailed { source, .. } => source.sql_state(),
            Error::InvalidState(_) => Some(sql_state::INVALID_TRANSACTION_STATE),
            _ => None,
        }
    }

    /// Whether this error was reported by the database/driver
    pub fn is_sql(&self) -> bool {
        matches!(self, Error::Sql { .. })
    }

    /// Whether this error is a serialization conflict reported by the database
    pub fn is_serialization_failure(&self) -> bool {
        matches!(self, Error::Sql { state, .. } if state == sql_state::SERIALIZATION_FAILURE)
    }

    /// Whether this error is a connection error reported by the driver
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Sql { state, .. } if sql_state::CONNECTION_ERRORS.contains(&state.as_str()))
    }

    /// The innermost error of a wrapping chain
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Rollback { source }
            | Error::TooManyRetries { source, .. }
            | Error::Interrupted { source } => source.root_cause(),
            Error::RetryFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io { kind, message } => io::Error::new(kind, message),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
