//! Per-module workflow session.
//!
//! Holds the in-memory `{state, known_version}` pair for one module and
//! drives it through [`benchsync_core::workflow`]. Every edit applies
//! locally at once and restarts a trailing-edge debounce timer. When the
//! timer fires, the current state is written with `known_version` as the
//! expected version.
//!
//! On conflict the authoritative state replaces the local copy and a
//! [`ReconcileNotice`] is raised for a few seconds. A second conflict in a
//! row blocks the module until [`ModuleSession::acknowledge`] is called.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use benchsync_core::workflow::{SyncMachine, SyncPhase, SyncSignal, transition};
use benchsync_core::{ModuleKind, ModulePayload, SyncError, Versioned, WriteRequest, decode_payload};

use crate::backend::SyncBackend;
use crate::error::ClientError;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);
pub const DEFAULT_NOTICE_TTL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Quiet period after the last edit before a write is sent.
    pub debounce: Duration,
    /// How long a reconciliation notice stays visible.
    pub notice_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            notice_ttl: DEFAULT_NOTICE_TTL,
        }
    }
}

/// Raised when local edits were replaced by the stored state after a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileNotice {
    pub module: ModuleKind,
    /// Version the discarded local edits were based on.
    pub local_version: u64,
    /// Version adopted from the store.
    pub version: u64,
}

impl ReconcileNotice {
    pub fn message(&self) -> String {
        format!(
            "{} was changed elsewhere; reloaded version {} and discarded local edits made on version {}",
            self.module, self.version, self.local_version
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatus {
    pub phase: SyncPhase,
    pub known_version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub has_unsaved_edits: bool,
    pub notice: Option<ReconcileNotice>,
    /// Sticky until the next successful write or reconciliation.
    pub error: Option<SyncError>,
}

struct Inner<S> {
    state: S,
    known_version: u64,
    updated_at: Option<DateTime<Utc>>,
    machine: SyncMachine,
    notice: Option<(ReconcileNotice, Instant)>,
    error: Option<SyncError>,
}

struct Shared<S, B> {
    backend: Arc<B>,
    config: SessionConfig,
    inner: Mutex<Inner<S>>,
    /// Serializes write attempts from the timer, `flush`, and `acknowledge`.
    persist_lock: Mutex<()>,
    kick: Notify,
    cancel: CancellationToken,
}

pub struct ModuleSession<S: ModulePayload, B: SyncBackend> {
    shared: Arc<Shared<S, B>>,
    debounce: Option<JoinHandle<()>>,
}

impl<S: ModulePayload, B: SyncBackend> ModuleSession<S, B> {
    /// Load the module's current state and start the debounce task.
    /// A module that was never written starts from `S::default()` at version 0.
    pub async fn open(backend: Arc<B>, config: SessionConfig) -> Result<Self, ClientError> {
        let (state, known_version, updated_at) = match backend.load_state(S::KIND).await? {
            Some(stored) => (
                decode_payload::<S>(stored.state)?,
                stored.version,
                Some(stored.updated_at),
            ),
            None => (S::default(), 0, None),
        };

        let shared = Arc::new(Shared {
            backend,
            config,
            inner: Mutex::new(Inner {
                state,
                known_version,
                updated_at,
                machine: SyncMachine::new(),
                notice: None,
                error: None,
            }),
            persist_lock: Mutex::new(()),
            kick: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let debounce = tokio::spawn(run_debounce(Arc::clone(&shared)));

        tracing::debug!(module = %S::KIND, version = known_version, "module session opened");
        Ok(Self {
            shared,
            debounce: Some(debounce),
        })
    }

    pub fn kind(&self) -> ModuleKind {
        S::KIND
    }

    /// Apply a local mutation. An edit that leaves the payload invalid is
    /// rolled back and never scheduled. A blocked module refuses edits until
    /// [`acknowledge`](Self::acknowledge), since the stored state replaces
    /// the local copy then.
    pub async fn edit<F: FnOnce(&mut S)>(&self, mutate: F) -> Result<(), ClientError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.machine.phase == SyncPhase::Blocked {
            return Err(ClientError::Blocked);
        }
        let mut next = inner.state.clone();
        mutate(&mut next);
        next.validate()?;

        inner.state = next;
        inner.machine = transition(inner.machine, SyncSignal::Edit);
        drop(inner);

        self.shared.kick.notify_one();
        Ok(())
    }

    pub async fn snapshot(&self) -> S {
        self.shared.inner.lock().await.state.clone()
    }

    pub async fn status(&self) -> ModuleStatus {
        let mut inner = self.shared.inner.lock().await;
        let ttl = self.shared.config.notice_ttl;
        if inner
            .notice
            .as_ref()
            .is_some_and(|(_, raised)| raised.elapsed() >= ttl)
        {
            inner.notice = None;
        }
        ModuleStatus {
            phase: inner.machine.phase,
            known_version: inner.known_version,
            updated_at: inner.updated_at,
            has_unsaved_edits: inner.machine.has_unsaved_edits(),
            notice: inner.notice.as_ref().map(|(notice, _)| notice.clone()),
            error: inner.error.clone(),
        }
    }

    /// Write pending edits now instead of waiting for the timer.
    pub async fn flush(&self) -> Result<(), ClientError> {
        self.shared.persist().await
    }

    /// Clear a conflict block: adopt the stored state and resume.
    /// A no-op unless the module is blocked.
    pub async fn acknowledge(&self) -> Result<(), ClientError> {
        let _serial = self.shared.persist_lock.lock().await;
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.machine.phase != SyncPhase::Blocked {
                return Ok(());
            }
            inner.machine = transition(inner.machine, SyncSignal::Acknowledge);
        }
        tracing::info!(module = %S::KIND, "conflict block acknowledged");
        self.shared.reconcile().await
    }

    /// Flush unsaved edits, then stop the debounce task.
    pub async fn close(mut self) -> Result<(), ClientError> {
        let unsaved = self.shared.inner.lock().await.machine.has_unsaved_edits();
        let result = if unsaved {
            self.shared.persist().await
        } else {
            Ok(())
        };

        self.shared.cancel.cancel();
        if let Some(task) = self.debounce.take() {
            if let Err(e) = task.await {
                tracing::warn!(module = %S::KIND, "debounce task ended abnormally: {e}");
            }
        }
        result
    }
}

impl<S: ModulePayload, B: SyncBackend> Drop for ModuleSession<S, B> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_debounce<S: ModulePayload, B: SyncBackend>(shared: Arc<Shared<S, B>>) {
    loop {
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return,
            () = shared.kick.notified() => {}
        }

        // Each further kick restarts the quiet period.
        loop {
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => return,
                () = shared.kick.notified() => {}
                () = tokio::time::sleep(shared.config.debounce) => break,
            }
        }

        if let Err(err) = shared.persist().await {
            tracing::debug!(module = %S::KIND, error = %err, "debounced persist did not complete");
        }
    }
}

impl<S: ModulePayload, B: SyncBackend> Shared<S, B> {
    async fn persist(&self) -> Result<(), ClientError> {
        let _serial = self.persist_lock.lock().await;

        let request = {
            let mut inner = self.inner.lock().await;
            match inner.machine.phase {
                SyncPhase::Dirty => {}
                // A previous reconcile fetch failed; retry it before anything else.
                SyncPhase::ConflictPendingReconcile => {
                    drop(inner);
                    return self.reconcile().await;
                }
                SyncPhase::Blocked => return Err(ClientError::Blocked),
                SyncPhase::Clean | SyncPhase::Persisting => return Ok(()),
            }
            let state = serde_json::to_value(&inner.state)
                .map_err(|e| SyncError::Validation(e.to_string()))?;
            inner.machine = transition(inner.machine, SyncSignal::TimerFired);
            WriteRequest {
                state,
                expected_version: inner.known_version,
            }
        };
        let expected = request.expected_version;

        match self.backend.write_state(S::KIND, request).await {
            Ok(committed) => {
                self.on_committed(committed).await;
                Ok(())
            }
            Err(SyncError::Conflict { expected_version }) => {
                self.on_conflict(expected, expected_version).await
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.machine = transition(inner.machine, SyncSignal::PersistFailed);
                inner.error = Some(err.clone());
                tracing::warn!(module = %S::KIND, error = %err, "persist failed; edit kept");
                Err(err.into())
            }
        }
    }

    async fn on_committed(&self, committed: Versioned<serde_json::Value>) {
        let mut inner = self.inner.lock().await;
        // The in-memory state may already be newer than what was written.
        inner.known_version = committed.version;
        inner.updated_at = Some(committed.updated_at);
        inner.error = None;
        inner.machine = transition(inner.machine, SyncSignal::PersistSucceeded);
        let still_dirty = inner.machine.phase == SyncPhase::Dirty;
        drop(inner);

        tracing::debug!(module = %S::KIND, version = committed.version, "module persisted");
        if still_dirty {
            self.kick.notify_one();
        }
    }

    async fn on_conflict(&self, expected: u64, stored: u64) -> Result<(), ClientError> {
        {
            let mut inner = self.inner.lock().await;
            inner.machine = transition(inner.machine, SyncSignal::PersistConflicted);
            if inner.machine.phase == SyncPhase::Blocked {
                inner.error = Some(SyncError::Conflict {
                    expected_version: stored,
                });
                tracing::warn!(
                    module = %S::KIND,
                    expected_version = expected,
                    stored_version = stored,
                    "repeated conflict; waiting for acknowledgement"
                );
                return Err(ClientError::Blocked);
            }
        }
        tracing::debug!(
            module = %S::KIND,
            expected_version = expected,
            stored_version = stored,
            "write conflicted; reconciling"
        );
        self.reconcile().await
    }

    /// Replace the local copy with the stored state.
    async fn reconcile(&self) -> Result<(), ClientError> {
        let fetched = match self.backend.load_state(S::KIND).await {
            Ok(Some(stored)) => decode_payload::<S>(stored.state)
                .map(|state| (state, stored.version, Some(stored.updated_at))),
            Ok(None) => Ok((S::default(), 0, None)),
            Err(err) => Err(err),
        };

        let mut inner = self.inner.lock().await;
        match fetched {
            Ok((state, version, updated_at)) => {
                let notice = ReconcileNotice {
                    module: S::KIND,
                    local_version: inner.known_version,
                    version,
                };
                inner.state = state;
                inner.known_version = version;
                inner.updated_at = updated_at;
                inner.machine = transition(inner.machine, SyncSignal::Reconciled);
                inner.error = None;
                inner.notice = Some((notice, Instant::now()));
                tracing::info!(module = %S::KIND, version, "reconciled to stored state");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(module = %S::KIND, error = %err, "reconcile fetch failed");
                inner.error = Some(err.clone());
                Err(err.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryBackend;
    use benchsync_core::module_state::{Scenario, ValuationState};
    use serde_json::json;

    type Session = ModuleSession<ValuationState, MemoryBackend>;

    async fn open(backend: &MemoryBackend) -> Session {
        ModuleSession::open(Arc::new(backend.clone()), SessionConfig::default())
            .await
            .unwrap()
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn valuation(scenario: &str, wacc: f64) -> serde_json::Value {
        json!({ "scenario": scenario, "overrides": { "wacc": wacc } })
    }

    fn set_wacc(wacc: f64) -> impl FnOnce(&mut ValuationState) {
        move |s| {
            s.overrides.insert("wacc".into(), wacc);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_loads_stored_state() {
        let backend = MemoryBackend::new("a");
        backend.force_write(ModuleKind::Valuation, valuation("bull", 0.09));

        let session = open(&backend).await;
        let state = session.snapshot().await;
        assert_eq!(state.scenario, Scenario::Bull);
        assert_eq!(state.overrides["wacc"], 0.09);

        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Clean);
        assert_eq!(status.known_version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_malformed_stored_payload() {
        let backend = MemoryBackend::new("a");
        backend.force_write(ModuleKind::Valuation, json!({ "scenario": 7 }));

        let result =
            ModuleSession::<ValuationState, _>::open(Arc::new(backend), SessionConfig::default())
                .await;
        assert!(matches!(
            result,
            Err(ClientError::Sync(SyncError::Validation(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_debounced_into_one_write() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;

        for wacc in [0.07, 0.08, 0.09] {
            session.edit(set_wacc(wacc)).await.unwrap();
            sleep_ms(300).await;
        }
        assert_eq!(session.status().await.phase, SyncPhase::Dirty);

        sleep_ms(600).await;
        assert_eq!(backend.writes(), 0);

        sleep_ms(200).await;
        assert_eq!(backend.writes(), 1);
        let stored = backend.stored(ModuleKind::Valuation).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state["overrides"]["wacc"], 0.09);

        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Clean);
        assert_eq!(status.known_version, 1);
        assert!(!status.has_unsaved_edits);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_edit_is_rolled_back() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;

        let result = session.edit(set_wacc(f64::NAN)).await;
        assert!(matches!(
            result,
            Err(ClientError::Sync(SyncError::Validation(_)))
        ));
        assert!(session.snapshot().await.overrides.is_empty());
        assert_eq!(session.status().await.phase, SyncPhase::Clean);

        sleep_ms(2_000).await;
        assert_eq!(backend.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_adopts_stored_state_and_raises_notice() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;
        backend
            .peer("b")
            .force_write(ModuleKind::Valuation, valuation("bear", 0.11));

        session.edit(set_wacc(0.05)).await.unwrap();
        sleep_ms(1_100).await;

        let state = session.snapshot().await;
        assert_eq!(state.scenario, Scenario::Bear);
        assert_eq!(state.overrides["wacc"], 0.11);

        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Clean);
        assert_eq!(status.known_version, 1);
        assert_eq!(status.error, None);
        let notice = status.notice.unwrap();
        assert_eq!(notice.local_version, 0);
        assert_eq!(notice.version, 1);

        sleep_ms(4_000).await;
        assert!(session.status().await.notice.is_none());
        assert_eq!(backend.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_conflict_in_a_row_blocks_until_acknowledged() {
        let backend = MemoryBackend::new("a");
        let other = backend.peer("b");
        let session = open(&backend).await;

        other.force_write(ModuleKind::Valuation, valuation("bear", 0.11));
        session.edit(set_wacc(0.05)).await.unwrap();
        sleep_ms(1_100).await;
        assert_eq!(session.status().await.phase, SyncPhase::Clean);

        other.force_write(ModuleKind::Valuation, valuation("bull", 0.12));
        session.edit(set_wacc(0.06)).await.unwrap();
        sleep_ms(1_100).await;

        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Blocked);
        assert_eq!(
            status.error,
            Some(SyncError::Conflict {
                expected_version: 2
            })
        );

        // Edits are refused and nothing is retried while blocked.
        assert_eq!(session.edit(set_wacc(0.07)).await, Err(ClientError::Blocked));
        assert_eq!(session.snapshot().await.overrides["wacc"], 0.06);
        sleep_ms(3_000).await;
        assert_eq!(session.status().await.phase, SyncPhase::Blocked);
        assert_eq!(session.flush().await, Err(ClientError::Blocked));
        assert_eq!(backend.writes(), 0);

        session.acknowledge().await.unwrap();
        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Clean);
        assert_eq!(status.known_version, 2);
        assert_eq!(status.error, None);
        assert_eq!(session.snapshot().await.scenario, Scenario::Bull);

        session.edit(set_wacc(0.08)).await.unwrap();
        session.flush().await.unwrap();
        assert_eq!(backend.stored(ModuleKind::Valuation).unwrap().version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_writer_reconciles_then_writes_next_version() {
        let backend = MemoryBackend::new("a");
        let other = backend.peer("b");
        for wacc in [0.01, 0.02, 0.03] {
            other.force_write(ModuleKind::Valuation, valuation("base", wacc));
        }

        let session = open(&backend).await;
        assert_eq!(session.status().await.known_version, 3);

        assert_eq!(
            other.force_write(ModuleKind::Valuation, valuation("bear", 0.04)),
            4
        );

        session.edit(set_wacc(0.10)).await.unwrap();
        session.flush().await.unwrap();
        let status = session.status().await;
        assert_eq!(status.known_version, 4);
        assert!(status.notice.is_some());
        assert_eq!(session.snapshot().await.overrides["wacc"], 0.04);

        session.edit(set_wacc(0.10)).await.unwrap();
        session.flush().await.unwrap();
        let stored = backend.stored(ModuleKind::Valuation).unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.state["overrides"]["wacc"], 0.10);
        assert_eq!(stored.state["scenario"], "bear");
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_keeps_edit_until_next_flush() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;
        backend.set_fail_writes(true);

        session.edit(set_wacc(0.05)).await.unwrap();
        sleep_ms(1_100).await;

        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Dirty);
        assert!(status.has_unsaved_edits);
        assert!(matches!(status.error, Some(SyncError::StoreUnavailable(_))));
        assert_eq!(session.snapshot().await.overrides["wacc"], 0.05);

        backend.set_fail_writes(false);
        session.flush().await.unwrap();

        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Clean);
        assert_eq!(status.error, None);
        assert_eq!(backend.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconcile_fetch_is_retried_on_flush() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;
        backend
            .peer("b")
            .force_write(ModuleKind::Valuation, valuation("bull", 0.2));
        backend.set_fail_loads(true);

        session.edit(set_wacc(0.05)).await.unwrap();
        sleep_ms(1_100).await;
        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::ConflictPendingReconcile);
        assert!(status.error.is_some());

        backend.set_fail_loads(false);
        session.flush().await.unwrap();
        let status = session.status().await;
        assert_eq!(status.phase, SyncPhase::Clean);
        assert_eq!(status.known_version, 1);
        assert_eq!(session.snapshot().await.scenario, Scenario::Bull);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_persist_is_written_next_cycle() {
        let backend = MemoryBackend::new("a");
        backend.set_write_delay(Duration::from_millis(500));
        let session = open(&backend).await;

        session.edit(set_wacc(0.05)).await.unwrap();
        // Timer fires at 1.0s; the write lands at 1.5s.
        sleep_ms(1_100).await;
        assert_eq!(session.status().await.phase, SyncPhase::Persisting);
        session.edit(set_wacc(0.06)).await.unwrap();

        sleep_ms(500).await;
        let status = session.status().await;
        assert_eq!(status.known_version, 1);
        assert_eq!(status.phase, SyncPhase::Dirty);
        assert_eq!(session.snapshot().await.overrides["wacc"], 0.06);
        assert_eq!(
            backend.stored(ModuleKind::Valuation).unwrap().state["overrides"]["wacc"],
            0.05
        );

        sleep_ms(2_000).await;
        let stored = backend.stored(ModuleKind::Valuation).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.state["overrides"]["wacc"], 0.06);
        assert_eq!(session.status().await.phase, SyncPhase::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_session_never_writes() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;
        session.edit(set_wacc(0.05)).await.unwrap();
        drop(session);

        sleep_ms(5_000).await;
        assert_eq!(backend.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_pending_edit() {
        let backend = MemoryBackend::new("a");
        let session = open(&backend).await;
        session.edit(set_wacc(0.05)).await.unwrap();

        session.close().await.unwrap();
        assert_eq!(backend.writes(), 1);

        sleep_ms(5_000).await;
        assert_eq!(backend.writes(), 1);
    }
}
