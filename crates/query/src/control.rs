//! In-band control statement
//!
//! `SET implicitSelectForUpdate = true|false` switches row locking on or off
//! for the rest of the current transaction. The statement is matched case
//! insensitively against the whole text and is never sent to the database;
//! anything after the boolean is ignored.

use once_cell::sync::Lazy;
use regex::Regex;

static SET_IMPLICIT_ROW_LOCKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^SET\s+implicitSelectForUpdate\s*=\s*(true|false).*$").expect("valid regex")
});

/// Recognize the row-locking toggle
///
/// Returns the requested setting, or `None` when `sql` is an ordinary
/// statement that must go to the database.
pub fn parse_control_statement(sql: &str) -> Option<bool> {
    let caps = SET_IMPLICIT_ROW_LOCKING.captures(sql)?;
    caps.get(1)
        .map(|value| value.as_str().eq_ignore_ascii_case("true"))
}
