//! Lexical query rewriting for sqlreplay
//!
//! This crate contains:
//! - QueryProcessor: the rewriting seam applied to statement text before it
//!   reaches the database
//! - SelectForUpdate: appends a row-locking clause to qualifying reads
//! - PassThrough: leaves every statement untouched
//! - control: recognizes the in-band `SET implicitSelectForUpdate` statement
//!
//! Rewriting is heuristic. Statements are matched on their lower-cased text;
//! nothing here parses SQL.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod select_for_update;

pub use control::parse_control_statement;
pub use select_for_update::{rewrite, SelectForUpdate, AGGREGATE_FUNCTIONS};

use std::fmt::Debug;

/// Rewrites statement text before it is sent to the database
///
/// Implementations are pure: the same inputs always yield the same output.
pub trait QueryProcessor: Send + Sync + Debug {
    /// Rewrite `sql` for a transaction that is read-only or not
    fn process(&self, read_only: bool, sql: &str) -> String;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Processor that returns every statement unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl QueryProcessor for PassThrough {
    fn process(&self, _read_only: bool, sql: &str) -> String {
        sql.to_string()
    }

    fn name(&self) -> &'static str {
        "pass-through"
    }
}

/// Processor matching an on/off row-locking switch
pub fn processor_for(row_locking: bool) -> &'static dyn QueryProcessor {
    if row_locking {
        &SelectForUpdate
    } else {
        &PassThrough
    }
}
