//! sqlreplay - transparent transaction retry for serializable SQL databases
//!
//! Serializable databases abort transactions that conflict with concurrent
//! work and expect the client to run them again. sqlreplay decorates an
//! existing client driver so that this happens without application code:
//! every call is recorded, and when a transaction fails with a transient
//! error the recorded calls are replayed on a fresh connection. Everything
//! the application read is folded into a checksum; if the replay reads the
//! same data the application carries on, otherwise it gets a
//! concurrent-update error.
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlreplay::{Connection, Driver, DriverOptions, ResultSetExt, Statement};
//!
//! let options = DriverOptions::new().with_retry_transient_errors(true);
//! let driver = Driver::new(my_factory, options)?;
//!
//! let mut conn = driver.connect()?;
//! conn.set_auto_commit(false)?;
//! let mut stmt = conn.create_statement()?;
//! let mut rs = stmt.execute_query("select balance from accounts where id = 1")?;
//! rs.next()?;
//! let balance = rs.get_i64(1)?;
//! stmt.execute_update("update accounts set balance = balance - 10 where id = 1")?;
//! conn.commit()?; // retried and verified on serialization failures
//! ```
//!
//! # Architecture
//!
//! - `sqlreplay-core`: errors, values and the driver traits
//! - `sqlreplay-query`: `FOR UPDATE` rewriting and the row-locking toggle
//! - `sqlreplay-concurrency`: recording proxies, checksums and the retry loop
//! - `sqlreplay-engine`: options, plugin registry and the `Driver` facade

pub use sqlreplay_concurrency::*;
pub use sqlreplay_core::*;
pub use sqlreplay_engine::*;
pub use sqlreplay_query::*;
