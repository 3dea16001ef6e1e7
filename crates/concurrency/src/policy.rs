//! Retry policies
//!
//! A `RetryPolicy` decides which errors are worth a retry, how long to wait
//! before each attempt and when to give up. Only errors reported by the
//! database or driver (`Error::Sql`) are ever classified as retryable;
//! errors produced by the retry layer itself are terminal.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlreplay_core::Error;

/// Default attempt ceiling
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;

/// Default backoff cap
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Decides whether and when a failed transaction is retried
pub trait RetryPolicy: Send + Sync + Debug {
    /// Whether `err` denotes a broken or unusable connection
    fn is_connection_error(&self, err: &Error) -> bool;

    /// Whether `err` may be recovered from by replaying the transaction
    fn is_retryable(&self, err: &Error) -> bool;

    /// Whether attempt number `attempt` (1-based) may proceed for a retry
    /// loop that started at `started`
    fn should_continue(&self, attempt: u32, started: Instant) -> bool;

    /// Delay before attempt number `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration;

    /// Human readable description, used in errors and logs
    fn description(&self) -> String;
}

/// Exponential backoff with jitter
///
/// Backoff for attempt `n` is `multiplier^n + 100ms + random(0..1000)ms`,
/// capped at `max_backoff`. Retryable errors are serialization failures,
/// plus connection errors when enabled.
#[derive(Debug)]
pub struct ExponentialBackoffPolicy {
    retry_connection_errors: bool,
    multiplier: f64,
    max_attempts: u32,
    max_backoff: Duration,
    max_elapsed: Option<Duration>,
    offset: Duration,
    jitter: Duration,
    rng: Mutex<StdRng>,
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            retry_connection_errors: false,
            multiplier: 2.0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_elapsed: None,
            offset: Duration::from_millis(100),
            jitter: Duration::from_millis(1000),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl ExponentialBackoffPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Also retry connection errors
    pub fn with_retry_connection_errors(mut self, enabled: bool) -> Self {
        self.retry_connection_errors = enabled;
        self
    }

    /// Set the exponential base (milliseconds)
    ///
    /// # Panics
    ///
    /// Panics if `multiplier` is not a positive number.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        assert!(multiplier > 0.0, "multiplier must be > 0");
        self.multiplier = multiplier;
        self
    }

    /// Set the attempt ceiling
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff cap
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Bound the whole retry loop by wall-clock time
    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Set the jitter window; zero disables jitter
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Seed the jitter source for reproducible backoff
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Attempt ceiling
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff cap
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Backoff for `attempt` without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        // float-to-int casts saturate
        let exp_ms = self.multiplier.powi(exponent) as u64;
        Duration::from_millis(exp_ms)
            .saturating_add(self.offset)
            .min(self.max_backoff)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn is_connection_error(&self, err: &Error) -> bool {
        err.is_connection_error()
    }

    fn is_retryable(&self, err: &Error) -> bool {
        if self.retry_connection_errors && self.is_connection_error(err) {
            return true;
        }
        err.is_serialization_failure()
    }

    fn should_continue(&self, attempt: u32, started: Instant) -> bool {
        attempt <= self.max_attempts
            && self
                .max_elapsed
                .map_or(true, |limit| started.elapsed() < limit)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(self.rng.lock().gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        self.base_backoff(attempt)
            .saturating_add(jitter)
            .min(self.max_backoff)
    }

    fn description(&self) -> String {
        format!(
            "ExponentialBackoffPolicy{{retry_connection_errors={}, multiplier={}, max_attempts={}, max_backoff={:?}, max_elapsed={:?}}}",
            self.retry_connection_errors,
            self.multiplier,
            self.max_attempts,
            self.max_backoff,
            self.max_elapsed
        )
    }
}

/// Policy that never retries anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn is_connection_error(&self, err: &Error) -> bool {
        err.is_connection_error()
    }

    fn is_retryable(&self, _err: &Error) -> bool {
        false
    }

    fn should_continue(&self, _attempt: u32, _started: Instant) -> bool {
        false
    }

    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn description(&self) -> String {
        "NeverRetry".to_string()
    }
}
