//! Driver builder
//!
//! Collects options and optional plugin instances, then resolves everything
//! once in [`DriverBuilder::build`]. Configuration errors surface there, not
//! on the first `connect()`.

use std::fmt;
use std::sync::Arc;

use sqlreplay_concurrency::{ConnectionSettings, RetryListener, RetryPolicy};
use sqlreplay_core::{ConnectionFactory, Result};
use tracing::debug;

use super::config::DriverOptions;
use super::registry::{PluginRegistry, GLOBAL_REGISTRY};
use super::{Driver, ExplicitTransactions};

// ============================================================================
// Driver Builder Pattern
// ============================================================================

/// Builder for a [`Driver`]
///
/// ```ignore
/// use sqlreplay_engine::{Driver, DriverOptions};
///
/// // Options only, plugins resolved by name from the global registry
/// let driver = Driver::builder(factory)
///     .options(DriverOptions::new().with_retry_transient_errors(true))
///     .build()?;
///
/// // Injected listener wins over the `retryListener` name
/// let driver = Driver::builder(factory)
///     .options(options)
///     .retry_listener(Arc::new(MyListener::default()))
///     .build()?;
/// ```
pub struct DriverBuilder {
    factory: Arc<dyn ConnectionFactory>,
    options: DriverOptions,
    registry: Option<PluginRegistry>,
    policy: Option<Arc<dyn RetryPolicy>>,
    listener: Option<Arc<dyn RetryListener>>,
}

impl fmt::Debug for DriverBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBuilder")
            .field("options", &self.options)
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl DriverBuilder {
    /// Create a builder with default options
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            options: DriverOptions::default(),
            registry: None,
            policy: None,
            listener: None,
        }
    }

    /// Replace the options
    pub fn options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve plugin names here instead of in the global registry
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this policy regardless of `retryStrategy`
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Use this listener regardless of `retryListener`
    pub fn retry_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Validate the options and resolve the retry plugins
    ///
    /// Plugins are only resolved when `retryTransientErrors` is set; without
    /// it nothing is recorded and no policy is ever consulted.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for inconsistent options or unknown plugin
    /// names.
    pub fn build(self) -> Result<Driver> {
        let options = self.options;
        options.validate()?;

        let mut settings = ConnectionSettings::new()
            .with_retry_enabled(options.retry_transient_errors)
            .with_implicit_row_locking(options.implicit_row_locking)
            .with_call_tracing(options.trace_calls, options.mask_sql_trace)
            .with_validation_timeout(options.validation_timeout()?);

        if options.retry_transient_errors {
            let registry = match self.registry {
                Some(registry) => registry,
                None => GLOBAL_REGISTRY.lock().clone(),
            };
            let policy = registry.resolve_policy(self.policy, &options)?;
            let listener = registry.resolve_listener(self.listener, &options)?;
            debug!(
                policy = %policy.description(),
                listener = ?listener,
                "Resolved retry plugins"
            );
            settings = settings
                .with_retry_policy(policy)
                .with_retry_listener(listener);
        }

        Ok(Driver {
            factory: Arc::clone(&self.factory),
            replacements: Arc::new(ExplicitTransactions {
                inner: self.factory,
            }),
            options,
            settings,
        })
    }
}
