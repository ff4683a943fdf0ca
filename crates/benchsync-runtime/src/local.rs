//! In-process backend: drives a [`SyncService`] directly, for embedding the
//! workflow client next to the server without HTTP.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use benchsync_client::SyncBackend;
use benchsync_core::{
    HeartbeatResponse, LogEntry, ModuleKind, NewLogEntry, PresenceEntry, SyncError, Versioned,
    WriteRequest,
};

use crate::service::{Caller, SyncService};

#[derive(Clone)]
pub struct LocalBackend {
    service: Arc<SyncService>,
    caller: Caller,
}

impl LocalBackend {
    pub fn new(service: Arc<SyncService>, caller: Caller) -> Self {
        Self { service, caller }
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

impl SyncBackend for LocalBackend {
    async fn load_state(&self, kind: ModuleKind) -> Result<Option<Versioned<Value>>, SyncError> {
        let caller = self.caller.clone();
        self.service
            .run(move |svc| svc.load_state(&caller, kind))
            .await
    }

    async fn write_state(
        &self,
        kind: ModuleKind,
        request: WriteRequest<Value>,
    ) -> Result<Versioned<Value>, SyncError> {
        let caller = self.caller.clone();
        self.service
            .run(move |svc| svc.write_state(&caller, kind, request, Utc::now()))
            .await?
            .into_result()
    }

    async fn heartbeat(&self, stage_slug: &str) -> Result<HeartbeatResponse, SyncError> {
        let caller = self.caller.clone();
        let stage_slug = stage_slug.to_owned();
        self.service
            .run(move |svc| svc.heartbeat(&caller, &stage_slug, Utc::now()))
            .await
    }

    async fn list_peers(&self, stage_slug: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        let stage_slug = stage_slug.to_owned();
        self.service
            .run(move |svc| svc.list_peers(&stage_slug, Utc::now()))
            .await
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, SyncError> {
        let caller = self.caller.clone();
        self.service
            .run(move |svc| svc.append_log(&caller, &entry, Utc::now()))
            .await
    }

    async fn fetch_log(&self) -> Result<Vec<LogEntry>, SyncError> {
        let caller = self.caller.clone();
        self.service.run(move |svc| svc.list_log(&caller)).await
    }
}
