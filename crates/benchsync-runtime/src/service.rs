//! Sync service: validation in front of the stores and the presence registry.
//!
//! Methods are synchronous and take `now` explicitly. Async callers go
//! through [`SyncService::run`], which moves the call onto the blocking pool
//! so SQLite never stalls the runtime.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use benchsync_core::activity_log::LOG_CAP;
use benchsync_core::presence::{DEFAULT_PRESENCE_TTL_SECS, PresenceRegistry};
use benchsync_core::{
    HeartbeatResponse, LogEntry, ModuleKind, ModuleState, NewLogEntry, PresenceEntry, SessionKey,
    StateEvent, SyncError, Versioned, WriteOutcome, WriteRequest,
};
use benchsync_store::{LogStore, StateStore, StoreError, clamp_history_limit};

/// Who is calling: the session the data belongs to, and the actor that
/// shows up in presence and history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub session: SessionKey,
    pub actor_id: String,
}

impl Caller {
    /// A missing or blank actor id falls back to the session key.
    pub fn new(session: SessionKey, actor_id: Option<&str>) -> Self {
        let actor_id = actor_id
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map_or_else(|| session.as_str().to_owned(), str::to_owned);
        Self { session, actor_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub presence_ttl: chrono::Duration,
    pub log_cap: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            presence_ttl: chrono::Duration::seconds(DEFAULT_PRESENCE_TTL_SECS),
            log_cap: LOG_CAP,
        }
    }
}

pub struct SyncService {
    states: Mutex<StateStore>,
    log: Mutex<LogStore>,
    presence: Mutex<PresenceRegistry>,
}

impl SyncService {
    /// Open both stores on one database file.
    pub fn open(path: &Path, config: ServiceConfig) -> Result<Self, SyncError> {
        let states = StateStore::open(path).map_err(unavailable)?;
        let log = LogStore::open(path, config.log_cap).map_err(unavailable)?;
        tracing::info!(db = %path.display(), "sync stores opened");
        Ok(Self::from_parts(states, log, config))
    }

    pub fn open_in_memory(config: ServiceConfig) -> Result<Self, SyncError> {
        let states = StateStore::open_in_memory().map_err(unavailable)?;
        let log = LogStore::open_in_memory(config.log_cap).map_err(unavailable)?;
        Ok(Self::from_parts(states, log, config))
    }

    fn from_parts(states: StateStore, log: LogStore, config: ServiceConfig) -> Self {
        Self {
            states: Mutex::new(states),
            log: Mutex::new(log),
            presence: Mutex::new(PresenceRegistry::with_ttl(config.presence_ttl)),
        }
    }

    /// Run a service call on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, call: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&SyncService) -> Result<T, SyncError> + Send + 'static,
    {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || call(&service))
            .await
            .map_err(|e| SyncError::StoreUnavailable(format!("service task failed: {e}")))?
    }

    // ─── Module state ─────────────────────────────────────────────

    pub fn load_state(
        &self,
        caller: &Caller,
        kind: ModuleKind,
    ) -> Result<Option<Versioned<Value>>, SyncError> {
        lock(&self.states)
            .load(&caller.session, kind)
            .map_err(unavailable)
    }

    /// Validate the payload against `kind`, then compare-and-swap.
    pub fn write_state(
        &self,
        caller: &Caller,
        kind: ModuleKind,
        request: WriteRequest<Value>,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome<Value>, SyncError> {
        let payload = ModuleState::parse(kind, request.state)?;
        let request = WriteRequest {
            state: payload.to_value()?,
            expected_version: request.expected_version,
        };
        let outcome = lock(&self.states)
            .write(&caller.session, kind, &caller.actor_id, request, now)
            .map_err(unavailable)?;

        if let WriteOutcome::Committed(versioned) = &outcome {
            tracing::info!(
                session = %caller.session,
                module = %kind,
                actor = %caller.actor_id,
                version = versioned.version,
                "state written"
            );
        }
        Ok(outcome)
    }

    pub fn history(
        &self,
        caller: &Caller,
        kind: ModuleKind,
        limit: Option<usize>,
    ) -> Result<Vec<StateEvent<Value>>, SyncError> {
        lock(&self.states)
            .history(&caller.session, kind, clamp_history_limit(limit))
            .map_err(unavailable)
    }

    // ─── Presence ─────────────────────────────────────────────────

    pub fn heartbeat(
        &self,
        caller: &Caller,
        stage_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, SyncError> {
        let stage_slug = require_stage(stage_slug)?;
        let peers = lock(&self.presence).heartbeat(stage_slug, &caller.actor_id, now);
        Ok(HeartbeatResponse {
            actor_id: caller.actor_id.clone(),
            stage_slug: stage_slug.to_owned(),
            updated_at: now,
            peers,
        })
    }

    pub fn list_peers(
        &self,
        stage_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PresenceEntry>, SyncError> {
        let stage_slug = require_stage(stage_slug)?;
        Ok(lock(&self.presence).list_peers(stage_slug, now))
    }

    // ─── Activity log ─────────────────────────────────────────────

    pub fn append_log(
        &self,
        caller: &Caller,
        entry: &NewLogEntry,
        now: DateTime<Utc>,
    ) -> Result<LogEntry, SyncError> {
        entry.validate()?;
        lock(&self.log)
            .append(&caller.session, &caller.actor_id, entry, now)
            .map_err(unavailable)
    }

    pub fn list_log(&self, caller: &Caller) -> Result<Vec<LogEntry>, SyncError> {
        lock(&self.log).list(&caller.session).map_err(unavailable)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn unavailable(err: StoreError) -> SyncError {
    tracing::error!(error = %err, "store operation failed");
    err.into()
}

fn require_stage(stage_slug: &str) -> Result<&str, SyncError> {
    let stage_slug = stage_slug.trim();
    if stage_slug.is_empty() {
        return Err(SyncError::validation("stageSlug must not be empty"));
    }
    Ok(stage_slug)
}
