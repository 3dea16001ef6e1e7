//! Driver options
//!
//! Options are read from a TOML document or from a string property map (the
//! way connection URLs hand them over). Keys are camelCase in both forms.
//! Durations are duration expressions, see [`super::duration`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use sqlreplay_concurrency::{DEFAULT_MAX_ATTEMPTS, DEFAULT_VALIDATION_TIMEOUT};
use sqlreplay_core::{Error, Result};

use super::duration::{format_duration, parse_duration};

/// Registry name of the default retry policy
pub const DEFAULT_RETRY_STRATEGY: &str = "exponential-backoff";

/// Registry name of the default retry listener
pub const DEFAULT_RETRY_LISTENER: &str = "logging";

/// Options controlling retries, row locking and tracing
///
/// # Example
///
/// ```toml
/// retryTransientErrors = true
/// retryConnectionErrors = false
/// retryMaxAttempts = 15
/// retryMaxBackoff = "30s"
/// implicitRowLocking = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverOptions {
    /// Record calls and replay transactions that fail with transient errors.
    #[serde(default)]
    pub retry_transient_errors: bool,
    /// Also retry connection errors. Requires `retry_transient_errors`.
    #[serde(default)]
    pub retry_connection_errors: bool,
    /// Attempt ceiling, must be greater than zero.
    #[serde(default = "default_max_attempts")]
    pub retry_max_attempts: u32,
    /// Backoff cap as a duration expression.
    #[serde(default = "default_max_backoff")]
    pub retry_max_backoff: String,
    /// Optional wall-clock bound on the retry loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_elapsed: Option<String>,
    /// Rewrite eligible queries with `FOR UPDATE` by default.
    #[serde(default, alias = "implicitSelectForUpdate")]
    pub implicit_row_locking: bool,
    /// Registry name of the retry policy.
    #[serde(default = "default_retry_strategy")]
    pub retry_strategy: String,
    /// Registry name of the retry listener.
    #[serde(default = "default_retry_listener")]
    pub retry_listener: String,
    /// Seed for the backoff jitter source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_seed: Option<u64>,
    /// Timeout of the liveness probe on replacement connections.
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: String,
    /// Emit a trace line before and after every intercepted call.
    #[serde(default)]
    pub trace_calls: bool,
    /// Hide call arguments in trace lines.
    #[serde(default)]
    pub mask_sql_trace: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_retry_strategy() -> String {
    DEFAULT_RETRY_STRATEGY.to_string()
}

fn default_retry_listener() -> String {
    DEFAULT_RETRY_LISTENER.to_string()
}

fn default_validation_timeout() -> String {
    format_duration(DEFAULT_VALIDATION_TIMEOUT)
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            retry_transient_errors: false,
            retry_connection_errors: false,
            retry_max_attempts: default_max_attempts(),
            retry_max_backoff: default_max_backoff(),
            retry_max_elapsed: None,
            implicit_row_locking: false,
            retry_strategy: default_retry_strategy(),
            retry_listener: default_retry_listener(),
            retry_seed: None,
            validation_timeout: default_validation_timeout(),
            trace_calls: false,
            mask_sql_trace: false,
        }
    }
}

impl DriverOptions {
    /// Options with every default
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable transient-error retries
    pub fn with_retry_transient_errors(mut self, enabled: bool) -> Self {
        self.retry_transient_errors = enabled;
        self
    }

    /// Enable or disable connection-error retries
    pub fn with_retry_connection_errors(mut self, enabled: bool) -> Self {
        self.retry_connection_errors = enabled;
        self
    }

    /// Set the attempt ceiling
    pub fn with_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    /// Set the backoff cap
    pub fn with_retry_max_backoff(mut self, backoff: Duration) -> Self {
        self.retry_max_backoff = format_duration(backoff);
        self
    }

    /// Bound the retry loop by wall-clock time
    pub fn with_retry_max_elapsed(mut self, elapsed: Option<Duration>) -> Self {
        self.retry_max_elapsed = elapsed.map(format_duration);
        self
    }

    /// Connection-default row locking
    pub fn with_implicit_row_locking(mut self, enabled: bool) -> Self {
        self.implicit_row_locking = enabled;
        self
    }

    /// Registry name of the retry policy
    pub fn with_retry_strategy(mut self, name: impl Into<String>) -> Self {
        self.retry_strategy = name.into();
        self
    }

    /// Registry name of the retry listener
    pub fn with_retry_listener(mut self, name: impl Into<String>) -> Self {
        self.retry_listener = name.into();
        self
    }

    /// Seed the backoff jitter
    pub fn with_retry_seed(mut self, seed: u64) -> Self {
        self.retry_seed = Some(seed);
        self
    }

    /// Liveness probe timeout
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = format_duration(timeout);
        self
    }

    /// Per-call trace logging
    pub fn with_call_tracing(mut self, enabled: bool, masked: bool) -> Self {
        self.trace_calls = enabled;
        self.mask_sql_trace = masked;
        self
    }

    /// Parsed backoff cap
    pub fn max_backoff(&self) -> Result<Duration> {
        parse_duration(&self.retry_max_backoff)
    }

    /// Parsed wall-clock bound, if any
    pub fn max_elapsed(&self) -> Result<Option<Duration>> {
        self.retry_max_elapsed
            .as_deref()
            .map(parse_duration)
            .transpose()
    }

    /// Parsed liveness probe timeout
    pub fn validation_timeout(&self) -> Result<Duration> {
        parse_duration(&self.validation_timeout)
    }

    /// Check that the options are consistent
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when connection-error retries are enabled
    /// without transient-error retries, when the attempt ceiling is zero,
    /// or when a duration expression does not parse.
    pub fn validate(&self) -> Result<()> {
        if self.retry_connection_errors && !self.retry_transient_errors {
            return Err(Error::Config(
                "retryConnectionErrors requires also retryTransientErrors".to_string(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(Error::Config(
                "retryMaxAttempts must be greater than zero".to_string(),
            ));
        }
        self.max_backoff()?;
        self.max_elapsed()?;
        self.validation_timeout()?;
        Ok(())
    }

    /// Parse and validate options from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let options: DriverOptions = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse driver options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Read and parse options from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read options file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(message) => {
                Error::Config(format!("{} (in '{}')", message, path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate options from a string property map
    ///
    /// Keys not listed in the options table belong to the underlying driver
    /// and are ignored.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in properties {
            let value = value.trim();
            match key.as_str() {
                "retryTransientErrors" => options.retry_transient_errors = parse_bool(key, value)?,
                "retryConnectionErrors" => {
                    options.retry_connection_errors = parse_bool(key, value)?
                }
                "retryMaxAttempts" => {
                    options.retry_max_attempts = value.parse().map_err(|_| {
                        Error::Config(format!("{} must be a positive integer: '{}'", key, value))
                    })?
                }
                "retryMaxBackoff" | "retryMaxBackoffTime" => {
                    options.retry_max_backoff = value.to_string()
                }
                "retryMaxElapsed" => options.retry_max_elapsed = Some(value.to_string()),
                "implicitRowLocking" | "implicitSelectForUpdate" => {
                    options.implicit_row_locking = parse_bool(key, value)?
                }
                "retryStrategy" => options.retry_strategy = value.to_string(),
                "retryListener" => options.retry_listener = value.to_string(),
                "retrySeed" => {
                    options.retry_seed = Some(value.parse().map_err(|_| {
                        Error::Config(format!("{} must be an unsigned integer: '{}'", key, value))
                    })?)
                }
                "validationTimeout" => options.validation_timeout = value.to_string(),
                "traceCalls" => options.trace_calls = parse_bool(key, value)?,
                "maskSqlTrace" => options.mask_sql_trace = parse_bool(key, value)?,
                _ => {}
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize driver options: {}", e)))
    }

    /// Returns the default options file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# sqlreplay driver options
#
# Record calls and replay transactions aborted by serialization failures
# (SQL state 40001). Off by default.
retryTransientErrors = false

# Also retry connection errors (08001, 08003, 08004, 08006, 08007, 08S01,
# 57P01). Requires retryTransientErrors.
retryConnectionErrors = false

# Attempt ceiling (default: 15)
retryMaxAttempts = 15

# Backoff cap. Durations are "<n><unit>" tokens (ms, s, m, h, d, w)
# or a bare number of milliseconds.
retryMaxBackoff = "30s"

# Optional wall-clock bound on the whole retry loop
# retryMaxElapsed = "2m"

# Append FOR UPDATE to eligible queries by default.
# Can be toggled per transaction with SET implicitSelectForUpdate = true|false
implicitRowLocking = false

# Registry names of the retry policy and listener
retryStrategy = "exponential-backoff"
retryListener = "logging"

# Seed for the backoff jitter (reproducible backoff)
# retrySeed = 42

# Liveness probe timeout on replacement connections
validationTimeout = "10s"

# Per-call TRACE logging; maskSqlTrace hides call arguments
traceCalls = false
maskSqlTrace = false
"#
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(Error::Config(format!(
            "{} must be true or false: '{}'",
            key, value
        )))
    }
}
