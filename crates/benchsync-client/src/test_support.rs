//! In-memory backend for unit tests. Clones share one server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use benchsync_core::activity_log::truncate_to_millis;
use benchsync_core::presence::PresenceRegistry;
use benchsync_core::{
    HeartbeatResponse, LogEntry, ModuleKind, NewLogEntry, PresenceEntry, SyncError, Versioned,
    WriteRequest,
};

use crate::backend::SyncBackend;

#[derive(Default)]
struct Server {
    states: HashMap<ModuleKind, Versioned<Value>>,
    log: Vec<LogEntry>,
    presence: PresenceRegistry,
    writes: usize,
    heartbeats: usize,
    write_delay: Option<Duration>,
    fail_writes: bool,
    fail_loads: bool,
    fail_log: bool,
    fail_presence: bool,
}

#[derive(Clone)]
pub(crate) struct MemoryBackend {
    server: Arc<Mutex<Server>>,
    actor: String,
}

impl MemoryBackend {
    pub(crate) fn new(actor: &str) -> Self {
        Self {
            server: Arc::new(Mutex::new(Server::default())),
            actor: actor.to_owned(),
        }
    }

    /// Another actor on the same server.
    pub(crate) fn peer(&self, actor: &str) -> Self {
        Self {
            server: Arc::clone(&self.server),
            actor: actor.to_owned(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Server) -> R) -> R {
        f(&mut self.server.lock().unwrap())
    }

    pub(crate) fn writes(&self) -> usize {
        self.with(|s| s.writes)
    }

    pub(crate) fn heartbeats(&self) -> usize {
        self.with(|s| s.heartbeats)
    }

    pub(crate) fn stored(&self, kind: ModuleKind) -> Option<Versioned<Value>> {
        self.with(|s| s.states.get(&kind).cloned())
    }

    /// Hold each write this long before applying it.
    pub(crate) fn set_write_delay(&self, delay: Duration) {
        self.with(|s| s.write_delay = Some(delay));
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.with(|s| s.fail_writes = fail);
    }

    pub(crate) fn set_fail_loads(&self, fail: bool) {
        self.with(|s| s.fail_loads = fail);
    }

    pub(crate) fn set_fail_log(&self, fail: bool) {
        self.with(|s| s.fail_log = fail);
    }

    pub(crate) fn set_fail_presence(&self, fail: bool) {
        self.with(|s| s.fail_presence = fail);
    }

    /// Write directly, as if another tab persisted first.
    pub(crate) fn force_write(&self, kind: ModuleKind, state: Value) -> u64 {
        self.with(|s| {
            let version = s.states.get(&kind).map_or(0, |v| v.version) + 1;
            s.states.insert(
                kind,
                Versioned {
                    state,
                    version,
                    updated_at: Utc::now(),
                },
            );
            version
        })
    }
}

impl SyncBackend for MemoryBackend {
    async fn load_state(&self, kind: ModuleKind) -> Result<Option<Versioned<Value>>, SyncError> {
        self.with(|s| {
            if s.fail_loads {
                return Err(SyncError::StoreUnavailable("loads disabled".into()));
            }
            Ok(s.states.get(&kind).cloned())
        })
    }

    async fn write_state(
        &self,
        kind: ModuleKind,
        request: WriteRequest<Value>,
    ) -> Result<Versioned<Value>, SyncError> {
        if let Some(delay) = self.with(|s| s.write_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.fail_writes {
                return Err(SyncError::StoreUnavailable("writes disabled".into()));
            }
            let stored = s.states.get(&kind).map_or(0, |v| v.version);
            if stored != request.expected_version {
                return Err(SyncError::Conflict {
                    expected_version: stored,
                });
            }
            let versioned = Versioned {
                state: request.state,
                version: stored + 1,
                updated_at: Utc::now(),
            };
            s.states.insert(kind, versioned.clone());
            s.writes += 1;
            Ok(versioned)
        })
    }

    async fn heartbeat(&self, stage_slug: &str) -> Result<HeartbeatResponse, SyncError> {
        self.with(|s| {
            if s.fail_presence {
                return Err(SyncError::Presence("presence disabled".into()));
            }
            s.heartbeats += 1;
            let now = Utc::now();
            let peers = s.presence.heartbeat(stage_slug, &self.actor, now);
            Ok(HeartbeatResponse {
                actor_id: self.actor.clone(),
                stage_slug: stage_slug.to_owned(),
                updated_at: now,
                peers,
            })
        })
    }

    async fn list_peers(&self, stage_slug: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        self.with(|s| {
            if s.fail_presence {
                return Err(SyncError::Presence("presence disabled".into()));
            }
            Ok(s.presence.list_peers(stage_slug, Utc::now()))
        })
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, SyncError> {
        self.with(|s| {
            if s.fail_log {
                return Err(SyncError::StoreUnavailable("log disabled".into()));
            }
            let confirmed = LogEntry {
                id: (s.log.len() + 1).to_string(),
                stage_slug: entry.stage_slug,
                stage_title: entry.stage_title,
                action: entry.action,
                details: entry.details,
                timestamp: truncate_to_millis(entry.timestamp.unwrap_or_else(Utc::now)),
            };
            s.log.push(confirmed.clone());
            Ok(confirmed)
        })
    }

    async fn fetch_log(&self) -> Result<Vec<LogEntry>, SyncError> {
        self.with(|s| {
            if s.fail_log {
                return Err(SyncError::StoreUnavailable("log disabled".into()));
            }
            let mut entries = s.log.clone();
            entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Ok(entries)
        })
    }
}
