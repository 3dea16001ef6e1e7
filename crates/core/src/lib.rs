//! Core types and traits for sqlreplay
//!
//! This crate defines the foundational types used throughout the system:
//! - Error: Error taxonomy and well-known SQL state codes
//! - Value: Typed column and parameter values
//! - Column, StreamKind, IsolationLevel: Identifier types for cursor access
//! - Traits: The client driver surface the retry layer decorates
//!   (Connection, Statement, PreparedStatement, ResultSet, ConnectionFactory)
//! - Testing (feature `test-util`): an in-memory scriptable driver

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;
pub mod value;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{sql_state, Error, Result};
pub use traits::{
    Connection, ConnectionFactory, PreparedStatement, ResultSet, ResultSetExt, Statement,
};
pub use types::{Column, IsolationLevel, StreamKind};
pub use value::Value;
