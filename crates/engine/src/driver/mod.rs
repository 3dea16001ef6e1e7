//! Driver facade
//!
//! `Driver` turns a connection factory plus [`DriverOptions`] into retrying
//! connections:
//!
//! - `connect()` opens the first handle through the factory and wraps it in
//!   a [`RetryConnection`]
//! - replacement handles opened during a retry go through the same factory
//!   and are switched to explicit transactions (auto-commit off) before the
//!   retry loop validates them
//!
//! With `retryTransientErrors` off the connection still rewrites queries for
//! implicit row locking and honours the control statement, but records
//! nothing and never retries.

pub mod builder;
pub mod config;
pub mod duration;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use sqlreplay_concurrency::{ConnectionSettings, RetryConnection};
use sqlreplay_core::{Connection, ConnectionFactory, Result};
use tracing::debug;

pub use builder::DriverBuilder;
pub use config::DriverOptions;

/// Factory for retrying connections
#[derive(Clone)]
pub struct Driver {
    factory: Arc<dyn ConnectionFactory>,
    replacements: Arc<dyn ConnectionFactory>,
    options: DriverOptions,
    settings: ConnectionSettings,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("options", &self.options)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Start building a driver over `factory`
    pub fn builder(factory: impl ConnectionFactory + 'static) -> DriverBuilder {
        DriverBuilder::new(Arc::new(factory))
    }

    /// Build a driver from options, resolving plugins by name
    pub fn new(factory: impl ConnectionFactory + 'static, options: DriverOptions) -> Result<Self> {
        Self::builder(factory).options(options).build()
    }

    /// Open a retrying connection
    pub fn connect(&self) -> Result<RetryConnection> {
        let delegate = self.factory.connect()?;
        let connection = RetryConnection::new(
            delegate,
            self.settings.clone(),
            Arc::clone(&self.replacements),
        );
        debug!(
            connection = %connection.connection_id(),
            retry = self.settings.retry_enabled(),
            row_locking = self.settings.implicit_row_locking(),
            "Opened connection"
        );
        Ok(connection)
    }

    /// Options this driver was built from
    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Settings handed to every connection
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

/// Opens replacement handles in explicit-transaction mode
pub(crate) struct ExplicitTransactions {
    pub(crate) inner: Arc<dyn ConnectionFactory>,
}

impl ConnectionFactory for ExplicitTransactions {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut connection = self.inner.connect()?;
        if let Err(e) = connection.set_auto_commit(false) {
            if let Err(close_err) = connection.close() {
                debug!(
                    error = %close_err,
                    "Could not close connection after auto-commit switch failed"
                );
            }
            return Err(e);
        }
        Ok(connection)
    }
}
