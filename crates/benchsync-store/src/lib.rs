//! benchsync-store: SQLite persistence for versioned module state and the
//! per-session activity log.
//!
//! Each store owns one connection. Several stores (in one process or many)
//! may point at the same database file; version checks are enforced inside
//! SQLite transactions, not in application code.

pub mod error;
pub mod log;
mod schema;
pub mod state;

pub use error::StoreError;
pub use log::LogStore;
pub use state::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT, StateStore, clamp_history_limit};
