//! The seam between client logic and the server.

use std::future::Future;

use serde_json::Value;

use benchsync_core::{
    HeartbeatResponse, LogEntry, ModuleKind, NewLogEntry, PresenceEntry, SyncError, Versioned,
    WriteRequest,
};

/// Server operations available to one session/actor.
///
/// Implementations are bound to a session key and actor id at construction.
/// A rejected compare-and-swap comes back as [`SyncError::Conflict`].
pub trait SyncBackend: Send + Sync + 'static {
    fn load_state(
        &self,
        kind: ModuleKind,
    ) -> impl Future<Output = Result<Option<Versioned<Value>>, SyncError>> + Send;

    fn write_state(
        &self,
        kind: ModuleKind,
        request: WriteRequest<Value>,
    ) -> impl Future<Output = Result<Versioned<Value>, SyncError>> + Send;

    fn heartbeat(
        &self,
        stage_slug: &str,
    ) -> impl Future<Output = Result<HeartbeatResponse, SyncError>> + Send;

    fn list_peers(
        &self,
        stage_slug: &str,
    ) -> impl Future<Output = Result<Vec<PresenceEntry>, SyncError>> + Send;

    fn append_log(
        &self,
        entry: NewLogEntry,
    ) -> impl Future<Output = Result<LogEntry, SyncError>> + Send;

    fn fetch_log(&self) -> impl Future<Output = Result<Vec<LogEntry>, SyncError>> + Send;
}
