//! benchsync-client: the per-view half of the sync substrate.
//!
//! [`ModuleSession`] owns one module's in-memory copy and drives it through
//! the phase machine in `benchsync_core::workflow`. [`ActivityFeed`] keeps
//! the optimistic log buffer, and [`ViewLoops`] runs the heartbeat and poll
//! loops for an open view. All of them talk to the server through a
//! [`SyncBackend`]; [`HttpBackend`] is the HTTP implementation.

pub mod backend;
pub mod error;
pub mod feed;
pub mod http;
pub mod loops;
pub mod session;

#[cfg(test)]
mod test_support;

pub use backend::SyncBackend;
pub use error::ClientError;
pub use feed::ActivityFeed;
pub use http::HttpBackend;
pub use loops::{LoopConfig, ViewLoops};
pub use session::{ModuleSession, ModuleStatus, ReconcileNotice, SessionConfig};
