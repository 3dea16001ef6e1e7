//! Driver traits
//!
//! These traits describe the client library the retry layer sits on top of:
//! a connection handle, ad-hoc and prepared statement handles, and a cursor.
//! They are object safe so handles can be boxed and swapped at runtime, and
//! `Send` so a handle (and everything proxied from it) can move to a worker
//! thread. None of them are `Sync`: a handle is used by one caller at a time.

use std::io::Read;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Column, IsolationLevel, StreamKind};
use crate::value::Value;

/// Connection (transaction) handle
pub trait Connection: Send {
    /// Create an ad-hoc statement
    fn create_statement(&mut self) -> Result<Box<dyn Statement>>;

    /// Prepare a parameterized statement
    fn prepare_statement(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Commit the current transaction
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction
    fn rollback(&mut self) -> Result<()>;

    /// Close the handle, releasing server resources
    fn close(&mut self) -> Result<()>;

    /// Whether the handle has been closed
    fn is_closed(&self) -> Result<bool>;

    /// Switch between auto-commit and explicit transactions
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    /// Whether every statement commits on its own
    fn auto_commit(&self) -> Result<bool>;

    /// Mark the connection read-only
    fn set_read_only(&mut self, read_only: bool) -> Result<()>;

    /// Whether the connection is read-only
    fn is_read_only(&self) -> Result<bool>;

    /// Set the isolation level for subsequent transactions
    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()>;

    /// Current isolation level
    fn transaction_isolation(&self) -> Result<IsolationLevel>;

    /// Liveness probe; must answer within `timeout`
    fn is_valid(&mut self, timeout: Duration) -> Result<bool>;

    /// Warnings reported by the server since the last call
    fn warnings(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Ad-hoc statement handle
pub trait Statement: Send {
    /// Execute any statement; `true` when it produced a result set
    fn execute(&mut self, sql: &str) -> Result<bool>;

    /// Execute a query and return its cursor
    fn execute_query(&mut self, sql: &str) -> Result<Box<dyn ResultSet>>;

    /// Execute a DML/DDL statement and return the affected row count
    fn execute_update(&mut self, sql: &str) -> Result<u64>;

    /// Queue a statement for batch execution
    fn add_batch(&mut self, sql: &str) -> Result<()>;

    /// Execute the queued batch
    fn execute_batch(&mut self) -> Result<Vec<u64>>;

    /// Cursor produced by the last `execute`, if any
    fn result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>>;

    /// Row count produced by the last `execute`, if any
    fn update_count(&mut self) -> Result<Option<u64>>;

    /// Limit the number of rows any cursor may return (0 = unlimited)
    fn set_max_rows(&mut self, max: usize) -> Result<()>;

    /// Release the statement
    fn close(&mut self) -> Result<()>;
}

/// Prepared (parameterized) statement handle
pub trait PreparedStatement: Send {
    /// Bind a value to a 1-based parameter position
    fn set_parameter(&mut self, index: usize, value: Value) -> Result<()>;

    /// Clear all parameter bindings
    fn clear_parameters(&mut self) -> Result<()>;

    /// Execute; `true` when it produced a result set
    fn execute(&mut self) -> Result<bool>;

    /// Execute as a query and return its cursor
    fn execute_query(&mut self) -> Result<Box<dyn ResultSet>>;

    /// Execute as an update and return the affected row count
    fn execute_update(&mut self) -> Result<u64>;

    /// Queue the current bindings for batch execution
    fn add_batch(&mut self) -> Result<()>;

    /// Execute the queued batch
    fn execute_batch(&mut self) -> Result<Vec<u64>>;

    /// Cursor produced by the last `execute`, if any
    fn result_set(&mut self) -> Result<Option<Box<dyn ResultSet>>>;

    /// Row count produced by the last `execute`, if any
    fn update_count(&mut self) -> Result<Option<u64>>;

    /// Limit the number of rows any cursor may return (0 = unlimited)
    fn set_max_rows(&mut self, max: usize) -> Result<()>;

    /// Release the statement
    fn close(&mut self) -> Result<()>;
}

/// Cursor over a query result
pub trait ResultSet: Send {
    /// Advance to the next row; `false` once exhausted
    fn next(&mut self) -> Result<bool>;

    /// Read a column of the current row
    fn get(&mut self, column: &Column) -> Result<Value>;

    /// Open a column of the current row as a stream
    fn get_stream(&mut self, column: &Column, kind: StreamKind) -> Result<Box<dyn Read + Send>>;

    /// Whether the last column read was SQL NULL
    fn was_null(&mut self) -> Result<bool>;

    /// Column labels of the result
    fn column_names(&mut self) -> Result<Vec<String>>;

    /// Release the cursor
    fn close(&mut self) -> Result<()>;
}

/// Typed accessors over [`ResultSet::get`]
///
/// Implemented for every cursor, trait objects included. SQL NULL maps to
/// `None`; a value of another type is an `InvalidState` error.
pub trait ResultSetExt: ResultSet {
    /// Read a text column
    fn get_string(&mut self, column: impl Into<Column>) -> Result<Option<String>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Text(s) | Value::Decimal(s) => Ok(Some(s)),
            other => other
                .canonical_text()
                .map(Some)
                .ok_or_else(|| type_mismatch("text", &other)),
        }
    }

    /// Read an integer column
    fn get_i64(&mut self, column: impl Into<Column>) -> Result<Option<i64>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Int(i) => Ok(Some(i)),
            other => Err(type_mismatch("integer", &other)),
        }
    }

    /// Read a floating point column
    fn get_f64(&mut self, column: impl Into<Column>) -> Result<Option<f64>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            other => other.as_f64().map(Some).ok_or_else(|| type_mismatch("float", &other)),
        }
    }

    /// Read a boolean column
    fn get_bool(&mut self, column: impl Into<Column>) -> Result<Option<bool>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b)),
            other => Err(type_mismatch("boolean", &other)),
        }
    }

    /// Read a binary column
    fn get_bytes(&mut self, column: impl Into<Column>) -> Result<Option<Vec<u8>>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Bytes(b) => Ok(Some(b)),
            other => Err(type_mismatch("bytes", &other)),
        }
    }

    /// Read a date column
    fn get_date(&mut self, column: impl Into<Column>) -> Result<Option<NaiveDate>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Date(d) => Ok(Some(d)),
            other => Err(type_mismatch("date", &other)),
        }
    }

    /// Read a timestamp column
    fn get_timestamp(&mut self, column: impl Into<Column>) -> Result<Option<NaiveDateTime>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Timestamp(ts) => Ok(Some(ts)),
            Value::TimestampTz(ts) => Ok(Some(ts.naive_utc())),
            other => Err(type_mismatch("timestamp", &other)),
        }
    }

    /// Read a UUID column
    fn get_uuid(&mut self, column: impl Into<Column>) -> Result<Option<Uuid>> {
        match self.get(&column.into())? {
            Value::Null => Ok(None),
            Value::Uuid(u) => Ok(Some(u)),
            other => Err(type_mismatch("uuid", &other)),
        }
    }
}

impl<R: ResultSet + ?Sized> ResultSetExt for R {}

fn type_mismatch(expected: &str, found: &Value) -> Error {
    Error::InvalidState(format!(
        "expected {} column, found {}",
        expected,
        found.type_name()
    ))
}

/// Source of fresh connection handles
///
/// The retry layer calls this to replace a poisoned handle. Implementations
/// may block on a pool or a network round trip.
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection handle
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Result<Box<dyn Connection>> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn Connection>> {
        self()
    }
}
