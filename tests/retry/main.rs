//! Workspace retry suite
//!
//! End-to-end transactions through `Driver` against the mock database.
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test retry
//! cargo test --test retry stress -- --ignored
//! ```

#[path = "../common/mod.rs"]
mod common;

mod concurrent_update;
mod stress;
mod transfers;
