//! Value types for sqlreplay
//!
//! This module defines:
//! - Value: typed column and parameter values exchanged with the driver
//!
//! ## Type Rules
//!
//! - Different variants are never equal: `Int(1) != Float(1.0)`
//! - `Bytes` are not `Text`
//! - `Decimal` carries plain decimal text (no exponent) so it round-trips
//!   without precision loss
//! - `Unsupported` stands for a driver type this crate has no model for;
//!   it only carries the driver's type name

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Typed value read from a cursor or bound to a statement parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// Arbitrary precision decimal in plain text form
    Decimal(String),
    /// UTF-8 string
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Timestamp without time zone
    Timestamp(NaiveDateTime),
    /// Timestamp in UTC
    TimestampTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// Driver value with no representation here, identified by type name
    Unsupported(String),
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Decimal(_) => "Decimal",
            Value::Text(_) => "Text",
            Value::Bytes(_) => "Bytes",
            Value::Date(_) => "Date",
            Value::Time(_) => "Time",
            Value::Timestamp(_) => "Timestamp",
            Value::TimestampTz(_) => "TimestampTz",
            Value::Uuid(_) => "Uuid",
            Value::Unsupported(name) => name.as_str(),
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text form used for hashing and display
    ///
    /// Returns `None` for `Null`, `Bytes` and `Unsupported`, which have no
    /// canonical text form.
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            Value::Null | Value::Bytes(_) | Value::Unsupported(_) => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Decimal(d) => Some(d.clone()),
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Some(t.format("%H:%M:%S%.f").to_string()),
            Value::Timestamp(ts) => Some(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::TimestampTz(ts) => Some(ts.to_rfc3339()),
            Value::Uuid(u) => Some(u.hyphenated().to_string()),
        }
    }

    /// Get as string reference if this is a text value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Get as i64 if this is an integer value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as bool if this is a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as byte slice if this is a bytes value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Unsupported(name) => write!(f, "<{}>", name),
            other => match other.canonical_text() {
                Some(text) => write!(f, "{}", text),
                None => write!(f, "?"),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(ts: NaiveDateTime) -> Self {
        Value::Timestamp(ts)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}
