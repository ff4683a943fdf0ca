//! Per-module client sync state machine.
//!
//! Pure and side-effect free. The async driver in `benchsync-client` feeds
//! signals in and acts on the resulting phase; [`transition`] is the single
//! entry point for all phase changes.
//!
//! ```text
//! Clean ──Edit──▶ Dirty ──TimerFired──▶ Persisting ──PersistSucceeded──▶ Clean (or Dirty)
//!                                          │
//!                                          ├─PersistConflicted──▶ ConflictPendingReconcile ──Reconciled──▶ Clean
//!                                          │                       (second in a row: Blocked)
//!                                          └─PersistFailed──▶ Dirty
//! Blocked ──Acknowledge──▶ ConflictPendingReconcile
//! ```

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Clean,
    /// Local edits not yet submitted; a persist is scheduled.
    Dirty,
    /// A write is in flight.
    Persisting,
    /// The last write lost; the authoritative state must be fetched.
    ConflictPendingReconcile,
    /// Conflicted again right after reconciling. Waits for an explicit
    /// acknowledgement instead of retrying.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    Edit,
    TimerFired,
    PersistSucceeded,
    PersistConflicted,
    PersistFailed,
    Reconciled,
    Acknowledge,
}

/// Machine state carried between transitions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncMachine {
    pub phase: SyncPhase,
    /// An edit landed while a write was in flight.
    pub edited_while_persisting: bool,
    /// Conflicts since the last successful write or acknowledgement.
    pub conflict_streak: u32,
}

impl SyncMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_unsaved_edits(&self) -> bool {
        matches!(self.phase, SyncPhase::Dirty) || self.edited_while_persisting
    }
}

/// Conflicts in a row that turn into a sticky block.
pub const CONFLICT_BLOCK_THRESHOLD: u32 = 2;

// ---------------------------------------------------------------------------
// Transition function
// ---------------------------------------------------------------------------

/// Apply one signal. Signals that make no sense in the current phase leave
/// the machine unchanged.
#[must_use]
pub fn transition(machine: SyncMachine, signal: SyncSignal) -> SyncMachine {
    use SyncPhase::*;
    use SyncSignal::*;

    let mut next = machine;
    match (machine.phase, signal) {
        (Clean | Dirty, Edit) => next.phase = Dirty,
        (Persisting, Edit) => next.edited_while_persisting = true,
        // Edits while reconciling or blocked stay local until the phase clears.
        (ConflictPendingReconcile | Blocked, Edit) => {}

        (Dirty, TimerFired) => {
            next.phase = Persisting;
            next.edited_while_persisting = false;
        }

        (Persisting, PersistSucceeded) => {
            next.phase = if machine.edited_while_persisting {
                Dirty
            } else {
                Clean
            };
            next.edited_while_persisting = false;
            next.conflict_streak = 0;
        }
        (Persisting, PersistConflicted) => {
            next.conflict_streak = machine.conflict_streak.saturating_add(1);
            next.phase = if next.conflict_streak >= CONFLICT_BLOCK_THRESHOLD {
                Blocked
            } else {
                ConflictPendingReconcile
            };
        }
        // The edit is kept; the next edit or flush retries.
        (Persisting, PersistFailed) => {
            next.phase = Dirty;
            next.edited_while_persisting = false;
        }

        (ConflictPendingReconcile, Reconciled) => {
            next.phase = Clean;
            next.edited_while_persisting = false;
        }

        (Blocked, Acknowledge) => {
            next.phase = ConflictPendingReconcile;
            next.conflict_streak = 0;
        }

        _ => {}
    }
    next
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
