//! Duration expressions
//!
//! Option values such as `retryMaxBackoff` accept either a bare integer
//! (milliseconds) or one or more `<n><unit>` tokens that are summed:
//!
//! | Unit | Meaning |
//! |------|---------|
//! | `ms` | milliseconds |
//! | `s`  | seconds |
//! | `m`  | minutes |
//! | `h`  | hours |
//! | `d`  | days |
//! | `w`  | weeks |
//!
//! Units are case-insensitive and tokens may be separated by whitespace, so
//! `"2m 3s 125ms"`, `"10h3m15s"` and `"30000"` are all valid.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use sqlreplay_core::{Error, Result};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([0-9]+)\s*([smhdw]+)").expect("valid regex"));

/// Parse a duration expression
///
/// # Errors
///
/// Returns `Error::Config` for an unknown unit, an overflowing amount, text
/// left over between or around tokens, or text that is neither a token list
/// nor an integer.
pub fn parse_duration(expression: &str) -> Result<Duration> {
    let expression = expression.trim();
    let mut total = Duration::ZERO;
    let mut matched = false;
    let mut covered = 0;

    for caps in TOKEN.captures_iter(expression) {
        matched = true;
        if let Some(whole) = caps.get(0) {
            if !expression[covered..whole.start()].trim().is_empty() {
                return Err(invalid(expression, "unexpected text between tokens"));
            }
            covered = whole.end();
        }
        let amount: u64 = caps[1]
            .parse()
            .map_err(|_| invalid(expression, "amount out of range"))?;
        let unit = caps[2].to_ascii_lowercase();
        let token = match unit.as_str() {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3_600).map(Duration::from_secs),
            "d" => amount.checked_mul(86_400).map(Duration::from_secs),
            "w" => amount.checked_mul(604_800).map(Duration::from_secs),
            other => {
                return Err(invalid(
                    expression,
                    &format!("unknown unit '{}'", other),
                ))
            }
        }
        .ok_or_else(|| invalid(expression, "amount out of range"))?;
        total = total
            .checked_add(token)
            .ok_or_else(|| invalid(expression, "amount out of range"))?;
    }

    if matched {
        if !expression[covered..].trim().is_empty() {
            return Err(invalid(expression, "unexpected text after tokens"));
        }
        return Ok(total);
    }

    expression
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(expression, "expected '<n><unit>' tokens or milliseconds"))
}

/// Render a duration as the shortest exact expression
///
/// `parse_duration(&format_duration(d))` yields `d` for whole milliseconds.
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, u128); 6] = [
        ("w", 604_800_000),
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ];

    let mut remaining = duration.as_millis();
    if remaining == 0 {
        return "0ms".to_string();
    }

    let mut out = String::new();
    for (unit, millis) in UNITS {
        let count = remaining / millis;
        if count > 0 {
            out.push_str(&format!("{}{}", count, unit));
            remaining %= millis;
        }
    }
    out
}

fn invalid(expression: &str, reason: &str) -> Error {
    Error::Config(format!(
        "Invalid duration expression '{}': {}",
        expression, reason
    ))
}
