//! benchsync-runtime: the sync server.
//!
//! [`service::SyncService`] validates requests and fronts the SQLite stores
//! and the presence registry; [`api`] exposes it over HTTP; [`server`] owns
//! the listener lifecycle. [`local::LocalBackend`] lets the workflow client
//! run against the service in-process.

pub mod api;
pub mod local;
pub mod server;
pub mod service;
