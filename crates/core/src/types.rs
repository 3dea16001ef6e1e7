//! Small identifier types shared by the driver traits

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column reference used by cursor accessors
///
/// Indexes are 1-based, following SQL driver convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    /// 1-based column position
    Index(usize),
    /// Column label as returned by the query
    Label(String),
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Column::Index(i) => write!(f, "{}", i),
            Column::Label(label) => write!(f, "{}", label),
        }
    }
}

impl From<usize> for Column {
    fn from(i: usize) -> Self {
        Column::Index(i)
    }
}

impl From<&str> for Column {
    fn from(label: &str) -> Self {
        Column::Label(label.to_string())
    }
}

impl From<String> for Column {
    fn from(label: String) -> Self {
        Column::Label(label)
    }
}

/// Kind of streamed column payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Raw binary payload
    Binary,
    /// Character payload, delivered as UTF-8 bytes
    Character,
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// READ COMMITTED
    ReadCommitted,
    /// REPEATABLE READ
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}
