//! Options files, property maps and plugin names

use crate::common::*;
use sqlreplay::{PluginRegistry, RetryPolicy, GLOBAL_REGISTRY};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_options_file_drives_retry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sqlreplay.toml");
    let content = DriverOptions::default_toml()
        .replace("retryTransientErrors = false", "retryTransientErrors = true")
        .replace("retryMaxBackoff = \"30s\"", "retryMaxBackoff = \"1ms\"");
    std::fs::write(&path, content).unwrap();

    let options = DriverOptions::from_file(&path).unwrap();
    assert!(options.retry_transient_errors);
    assert_eq!(options.max_backoff().unwrap(), Duration::from_millis(1));

    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let mut conn = bank.connect(options);
    transfer(&mut conn, 1, 2, 10).unwrap();
    bank.abort_commits(1);
    conn.commit().unwrap();
}

#[test]
fn test_property_map_with_driver_keys() {
    let properties: HashMap<String, String> = [
        ("user", "app"),
        ("password", "secret"),
        ("sslmode", "disable"),
        ("retryTransientErrors", "true"),
        ("retryMaxBackoff", "5ms"),
        ("implicitSelectForUpdate", "true"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let options = DriverOptions::from_properties(&properties).unwrap();
    let bank = Bank::new(&[(1, 100)]);
    let driver = bank.driver(options);
    assert!(driver.settings().retry_enabled());
    assert!(driver.settings().implicit_row_locking());
}

#[test]
fn test_invalid_options_fail_fast() {
    let bank = Bank::new(&[(1, 100)]);

    let zero = fast_options().with_retry_max_attempts(0);
    assert!(matches!(
        Driver::new(bank.db.factory(), zero),
        Err(Error::Config(_))
    ));

    let lonely = DriverOptions::new().with_retry_connection_errors(true);
    assert!(matches!(
        Driver::new(bank.db.factory(), lonely),
        Err(Error::Config(_))
    ));

    let unknown = fast_options().with_retry_listener("carrier-pigeon");
    let err = Driver::new(bank.db.factory(), unknown).unwrap_err();
    assert!(err.to_string().contains("carrier-pigeon"));
}

#[test]
fn test_seeded_backoff_is_reproducible() {
    let registry = PluginRegistry::with_builtins();
    let options = DriverOptions::new()
        .with_retry_transient_errors(true)
        .with_retry_seed(42);

    let first = registry.resolve_policy(None, &options).unwrap();
    let second = registry.resolve_policy(None, &options).unwrap();
    let a: Vec<Duration> = (1..=6).map(|n| first.backoff(n)).collect();
    let b: Vec<Duration> = (1..=6).map(|n| second.backoff(n)).collect();
    assert_eq!(a, b);
    assert!(a.iter().all(|d| *d <= Duration::from_secs(30)));
}

#[test]
fn test_globally_registered_listener() {
    static BUILT: AtomicUsize = AtomicUsize::new(0);
    GLOBAL_REGISTRY
        .lock()
        .register_listener("suite-recording", |_: &DriverOptions| {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingListener::default()) as Arc<dyn RetryListener>)
        });

    let bank = Bank::new(&[(1, 100), (2, 50)]);
    let driver = bank.driver(fast_options().with_retry_listener("suite-recording"));
    assert_eq!(BUILT.load(Ordering::SeqCst), 1);

    let mut conn = driver.connect().unwrap();
    conn.set_auto_commit(false).unwrap();
    transfer(&mut conn, 1, 2, 10).unwrap();
    bank.abort_commits(1);
    conn.commit().unwrap();
}

#[test]
fn test_policy_description_reflects_options() {
    let bank = Bank::new(&[(1, 100)]);
    let options = fast_options()
        .with_retry_connection_errors(true)
        .with_retry_max_elapsed(Some(Duration::from_secs(5)));
    let driver = bank.driver(options);
    let policy: &Arc<dyn RetryPolicy> = driver.settings().retry_policy();
    let description = policy.description();
    assert!(description.contains("retry_connection_errors=true"));
    assert!(description.contains("max_attempts=5"));
    assert!(description.contains("max_elapsed=Some(5s)"));
}
