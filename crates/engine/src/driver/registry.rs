//! Named retry plugins
//!
//! Options select the retry policy and listener by name. A `PluginRegistry`
//! maps those names to constructors that build the plugin from the options.
//! An instance injected directly into the driver builder always wins over
//! the name lookup.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sqlreplay_concurrency::{
    ExponentialBackoffPolicy, LoggingRetryListener, NeverRetry, NoopRetryListener, RetryListener,
    RetryPolicy,
};
use sqlreplay_core::{Error, Result};

use super::config::DriverOptions;

/// Builds a retry policy from driver options
pub type PolicyConstructor =
    Arc<dyn Fn(&DriverOptions) -> Result<Arc<dyn RetryPolicy>> + Send + Sync>;

/// Builds a retry listener from driver options
pub type ListenerConstructor =
    Arc<dyn Fn(&DriverOptions) -> Result<Arc<dyn RetryListener>> + Send + Sync>;

/// Name to constructor tables for retry policies and listeners
#[derive(Clone, Default)]
pub struct PluginRegistry {
    policies: HashMap<String, PolicyConstructor>,
    listeners: HashMap<String, ListenerConstructor>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("policies", &self.policy_names())
            .field("listeners", &self.listener_names())
            .finish()
    }
}

impl PluginRegistry {
    /// Registry with no plugins at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins
    ///
    /// Policies: `exponential-backoff`, `never`.
    /// Listeners: `logging`, `none`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_policy("exponential-backoff", |options: &DriverOptions| {
            let mut policy = ExponentialBackoffPolicy::new()
                .with_retry_connection_errors(options.retry_connection_errors)
                .with_max_attempts(options.retry_max_attempts)
                .with_max_backoff(options.max_backoff()?)
                .with_max_elapsed(options.max_elapsed()?);
            if let Some(seed) = options.retry_seed {
                policy = policy.with_seed(seed);
            }
            Ok(Arc::new(policy) as Arc<dyn RetryPolicy>)
        });
        registry.register_policy("never", |_: &DriverOptions| {
            Ok(Arc::new(NeverRetry) as Arc<dyn RetryPolicy>)
        });
        registry.register_listener("logging", |options: &DriverOptions| {
            Ok(Arc::new(LoggingRetryListener::new(options.retry_max_attempts))
                as Arc<dyn RetryListener>)
        });
        registry.register_listener("none", |_: &DriverOptions| {
            Ok(Arc::new(NoopRetryListener) as Arc<dyn RetryListener>)
        });
        registry
    }

    /// Register a policy constructor, replacing any previous one of that name
    pub fn register_policy<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverOptions) -> Result<Arc<dyn RetryPolicy>> + Send + Sync + 'static,
    {
        self.policies.insert(name.into(), Arc::new(constructor));
    }

    /// Register a listener constructor, replacing any previous one of that name
    pub fn register_listener<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverOptions) -> Result<Arc<dyn RetryListener>> + Send + Sync + 'static,
    {
        self.listeners.insert(name.into(), Arc::new(constructor));
    }

    /// Registered policy names, sorted
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered listener names, sorted
    pub fn listener_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.keys().cloned().collect();
        names.sort();
        names
    }

    /// The injected policy, or the one named by `options.retry_strategy`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when no policy is injected and the name is
    /// not registered, or when the constructor rejects the options.
    pub fn resolve_policy(
        &self,
        injected: Option<Arc<dyn RetryPolicy>>,
        options: &DriverOptions,
    ) -> Result<Arc<dyn RetryPolicy>> {
        if let Some(policy) = injected {
            return Ok(policy);
        }
        let constructor = self.policies.get(&options.retry_strategy).ok_or_else(|| {
            Error::Config(format!(
                "Unknown retry strategy '{}'. Registered: {}",
                options.retry_strategy,
                self.policy_names().join(", ")
            ))
        })?;
        constructor(options)
    }

    /// The injected listener, or the one named by `options.retry_listener`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when no listener is injected and the name is
    /// not registered, or when the constructor rejects the options.
    pub fn resolve_listener(
        &self,
        injected: Option<Arc<dyn RetryListener>>,
        options: &DriverOptions,
    ) -> Result<Arc<dyn RetryListener>> {
        if let Some(listener) = injected {
            return Ok(listener);
        }
        let constructor = self.listeners.get(&options.retry_listener).ok_or_else(|| {
            Error::Config(format!(
                "Unknown retry listener '{}'. Registered: {}",
                options.retry_listener,
                self.listener_names().join(", ")
            ))
        })?;
        constructor(options)
    }
}

// =============================================================================
// Process-wide Registry
// =============================================================================
//
// Drivers built without an explicit registry resolve plugin names here.
// Applications register their own policies and listeners at startup, before
// the first driver is built. Later registrations only affect drivers built
// afterwards; a built driver keeps the plugins it resolved.

/// Process-wide plugin registry, seeded with the built-in plugins
pub static GLOBAL_REGISTRY: Lazy<Mutex<PluginRegistry>> =
    Lazy::new(|| Mutex::new(PluginRegistry::with_builtins()));

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct Fixed;

    impl RetryPolicy for Fixed {
        fn is_connection_error(&self, _err: &Error) -> bool {
            false
        }
        fn is_retryable(&self, _err: &Error) -> bool {
            true
        }
        fn should_continue(&self, attempt: u32, _started: Instant) -> bool {
            attempt <= 1
        }
        fn backoff(&self, _attempt: u32) -> Duration {
            Duration::ZERO
        }
        fn description(&self) -> String {
            "Fixed".to_string()
        }
    }

    #[test]
    fn test_builtin_names() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.policy_names(), vec!["exponential-backoff", "never"]);
        assert_eq!(registry.listener_names(), vec!["logging", "none"]);
    }

    #[test]
    fn test_default_policy_reads_options() {
        let registry = PluginRegistry::with_builtins();
        let options = DriverOptions::new()
            .with_retry_transient_errors(true)
            .with_retry_connection_errors(true)
            .with_retry_max_attempts(4);
        let policy = registry.resolve_policy(None, &options).unwrap();

        let description = policy.description();
        assert!(description.contains("retry_connection_errors=true"));
        assert!(description.contains("max_attempts=4"));
        assert!(policy.should_continue(4, Instant::now()));
        assert!(!policy.should_continue(5, Instant::now()));
    }

    #[test]
    fn test_injected_policy_wins() {
        let registry = PluginRegistry::with_builtins();
        let options = DriverOptions::new().with_retry_strategy("does-not-exist");
        let policy = registry
            .resolve_policy(Some(Arc::new(Fixed)), &options)
            .unwrap();
        assert_eq!(policy.description(), "Fixed");
    }

    #[test]
    fn test_unknown_name_rejected() {
        let registry = PluginRegistry::with_builtins();
        let options = DriverOptions::new().with_retry_listener("pager");
        let err = registry.resolve_listener(None, &options).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("pager"));
        assert!(err.to_string().contains("logging, none"));
    }

    #[test]
    fn test_constructor_errors_propagate() {
        let registry = PluginRegistry::with_builtins();
        let mut options = DriverOptions::new();
        options.retry_max_backoff = "later".to_string();
        assert!(matches!(
            registry.resolve_policy(None, &options),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = PluginRegistry::empty();
        registry.register_policy("custom", |_: &DriverOptions| {
            Ok(Arc::new(NeverRetry) as Arc<dyn RetryPolicy>)
        });
        registry.register_policy("custom", |_: &DriverOptions| {
            Ok(Arc::new(Fixed) as Arc<dyn RetryPolicy>)
        });
        let options = DriverOptions::new().with_retry_strategy("custom");
        let policy = registry.resolve_policy(None, &options).unwrap();
        assert_eq!(policy.description(), "Fixed");
        assert_eq!(registry.policy_names(), vec!["custom"]);
    }

    #[test]
    fn test_global_registry_has_builtins() {
        let registry = GLOBAL_REGISTRY.lock();
        assert!(registry.policy_names().contains(&"exponential-backoff".to_string()));
        assert!(registry.listener_names().contains(&"logging".to_string()));
    }
}
