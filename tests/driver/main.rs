//! Workspace driver suite
//!
//! Configuration loading and row locking seen from the application side.
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test driver
//! ```

#[path = "../common/mod.rs"]
mod common;

mod options;
mod row_locking;
