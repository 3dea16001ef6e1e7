//! Per-connection settings
//!
//! `ConnectionSettings` is fixed once a `RetryConnection` is built. The
//! per-transaction row-locking override lives in the coordinator, not here.

use std::sync::Arc;
use std::time::Duration;

use sqlreplay_query::{PassThrough, QueryProcessor, SelectForUpdate};

use crate::listener::{NoopRetryListener, RetryListener};
use crate::policy::{ExponentialBackoffPolicy, RetryPolicy};
use crate::trace::CallTracer;

/// Default timeout of the liveness probe on replacement connections
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by a retrying connection and every proxy it hands out
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    retry_enabled: bool,
    implicit_row_locking: bool,
    query_processor: Arc<dyn QueryProcessor>,
    retry_policy: Arc<dyn RetryPolicy>,
    retry_listener: Arc<dyn RetryListener>,
    tracer: CallTracer,
    validation_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            implicit_row_locking: false,
            query_processor: Arc::new(PassThrough),
            retry_policy: Arc::new(ExponentialBackoffPolicy::default()),
            retry_listener: Arc::new(NoopRetryListener),
            tracer: CallTracer::disabled(),
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
        }
    }
}

impl ConnectionSettings {
    /// Settings with retries enabled, no row locking and no listener
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls and replay on retryable failures
    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    /// Connection-default row-locking rewrite
    pub fn with_implicit_row_locking(mut self, enabled: bool) -> Self {
        self.implicit_row_locking = enabled;
        self.query_processor = if enabled {
            Arc::new(SelectForUpdate)
        } else {
            Arc::new(PassThrough)
        };
        self
    }

    /// Use a custom connection-default query processor
    pub fn with_query_processor(mut self, processor: Arc<dyn QueryProcessor>) -> Self {
        self.query_processor = processor;
        self
    }

    /// Retry policy
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Retry observer
    pub fn with_retry_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.retry_listener = listener;
        self
    }

    /// Per-call trace logging
    pub fn with_call_tracing(mut self, enabled: bool, masked: bool) -> Self {
        self.tracer = CallTracer::new(enabled, masked);
        self
    }

    /// Timeout of the liveness probe on replacement connections
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Whether calls are recorded and replayed
    pub fn retry_enabled(&self) -> bool {
        self.retry_enabled
    }

    /// Connection-default row locking
    pub fn implicit_row_locking(&self) -> bool {
        self.implicit_row_locking
    }

    /// Connection-default query processor
    pub fn query_processor(&self) -> &Arc<dyn QueryProcessor> {
        &self.query_processor
    }

    /// Retry policy
    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    /// Retry observer
    pub fn retry_listener(&self) -> &Arc<dyn RetryListener> {
        &self.retry_listener
    }

    /// Call tracer
    pub fn tracer(&self) -> CallTracer {
        self.tracer
    }

    /// Liveness probe timeout
    pub fn validation_timeout(&self) -> Duration {
        self.validation_timeout
    }
}
