//! Driver assembly for sqlreplay
//!
//! This crate turns configuration into retrying connections:
//! - DriverOptions: TOML / property-map options with duration expressions
//! - PluginRegistry: named retry policies and listeners
//! - Driver: opens `RetryConnection`s over any `ConnectionFactory`
//!
//! The retry machinery itself lives in `sqlreplay-concurrency`; this crate
//! only decides how it is configured.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;

pub use driver::config::{DriverOptions, DEFAULT_RETRY_LISTENER, DEFAULT_RETRY_STRATEGY};
pub use driver::duration::{format_duration, parse_duration};
pub use driver::registry::{ListenerConstructor, PluginRegistry, PolicyConstructor, GLOBAL_REGISTRY};
pub use driver::{Driver, DriverBuilder};
