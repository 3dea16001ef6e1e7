//! Retry observers
//!
//! A `RetryListener` is told about every retry attempt. It is purely
//! observational: nothing it does changes the outcome of the retry loop.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sqlreplay_core::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::execution::HandleId;

/// State of one retry loop, handed to listeners
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Correlation id shared by every log line of this retry loop
    pub trace_id: Uuid,
    /// Operation whose failure started the loop, e.g. `commit`
    pub operation: &'static str,
    /// Current attempt, 1-based
    pub attempt: u32,
    /// When the loop started
    pub started: Instant,
    /// The retryable error that started the loop
    pub last_error: Error,
    /// Connection handle the attempt runs against
    pub connection: HandleId,
}

/// Observer of retry attempts
pub trait RetryListener: Send + Sync + Debug {
    /// Called before the backoff wait of an attempt
    fn before_retry(&self, _ctx: &RetryContext, _backoff: Duration) {}

    /// Called after every attempt; `error` is `None` when the replay succeeded
    fn after_retry(&self, _ctx: &RetryContext, _error: Option<&Error>, _elapsed: Duration) {}
}

/// Listener that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetryListener;

impl RetryListener for NoopRetryListener {}

/// Listener that logs each attempt and keeps running totals
#[derive(Debug, Default)]
pub struct LoggingRetryListener {
    max_attempts: u32,
    total_success: AtomicU64,
    total_failures: AtomicU64,
}

impl LoggingRetryListener {
    /// Create a listener reporting attempts out of `max_attempts`
    pub fn new(max_attempts: u32) -> Self {
        LoggingRetryListener {
            max_attempts,
            ..Default::default()
        }
    }

    /// Number of attempts whose replay succeeded
    pub fn total_successful_retries(&self) -> u64 {
        self.total_success.load(Ordering::Relaxed)
    }

    /// Number of attempts that failed
    pub fn total_failed_retries(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Reset both totals
    pub fn reset_counters(&self) {
        self.total_success.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
    }
}

impl RetryListener for LoggingRetryListener {
    fn before_retry(&self, ctx: &RetryContext, backoff: Duration) {
        info!(
            target: "sqlreplay::retry",
            trace_id = %ctx.trace_id,
            attempt = ctx.attempt,
            max_attempts = self.max_attempts,
            operation = ctx.operation,
            backoff = ?backoff,
            error = %ctx.last_error,
            "Transaction retry started"
        );
    }

    fn after_retry(&self, ctx: &RetryContext, error: Option<&Error>, elapsed: Duration) {
        match error {
            Some(e) => {
                let failures = self.total_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    target: "sqlreplay::retry",
                    trace_id = %ctx.trace_id,
                    attempt = ctx.attempt,
                    max_attempts = self.max_attempts,
                    operation = ctx.operation,
                    elapsed = ?elapsed,
                    total_success = self.total_success.load(Ordering::Relaxed),
                    total_failures = failures,
                    error = %e,
                    "Transaction retry failed"
                );
            }
            None => {
                let successes = self.total_success.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    target: "sqlreplay::retry",
                    trace_id = %ctx.trace_id,
                    attempt = ctx.attempt,
                    max_attempts = self.max_attempts,
                    operation = ctx.operation,
                    elapsed = ?elapsed,
                    total_success = successes,
                    total_failures = self.total_failures.load(Ordering::Relaxed),
                    "Transaction retry successful"
                );
            }
        }
    }
}
