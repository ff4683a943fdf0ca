//! Versioned module state with compare-and-swap writes.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use benchsync_core::{ModuleKind, SessionKey, StateEvent, Versioned, WriteOutcome, WriteRequest};

use crate::error::StoreError;
use crate::schema::{format_ts, from_sql_int, open_file, open_memory, parse_ts, to_sql_int};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Clamp a requested history length to `1..=MAX_HISTORY_LIMIT`.
pub fn clamp_history_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

/// SQLite-backed store: one row per (session, module), plus an append-only
/// event per accepted write.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) a database at the given filesystem path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: open_file(path)?,
        })
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: open_memory()?,
        })
    }

    pub fn load<S: DeserializeOwned>(
        &self,
        session: &SessionKey,
        kind: ModuleKind,
    ) -> Result<Option<Versioned<S>>, StoreError> {
        let row: Option<(String, i64, String)> = self
            .conn
            .query_row(
                "SELECT state, version, updated_at
                 FROM module_states
                 WHERE session_id = ?1 AND module_kind = ?2",
                params![session.as_str(), kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((state, version, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            state: serde_json::from_str(&state)?,
            version: from_sql_int("module_states", version)?,
            updated_at: parse_ts("module_states", &updated_at)?,
        }))
    }

    /// Write `request.state` iff the stored version equals
    /// `request.expected_version` (0 when no row exists).
    ///
    /// The version check, the row update, and the history append run in one
    /// `IMMEDIATE` transaction. On mismatch nothing is written and the
    /// outcome carries the stored version.
    pub fn write<S: Serialize>(
        &mut self,
        session: &SessionKey,
        kind: ModuleKind,
        actor_id: &str,
        request: WriteRequest<S>,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome<S>, StoreError> {
        let payload = serde_json::to_string(&request.state)?;
        // A version with no successor in an INTEGER column never matches a
        // stored row; it falls through to the conflict path.
        let next_version = i64::try_from(request.expected_version)
            .ok()
            .and_then(|expected| expected.checked_add(1));
        let updated_at = format_ts(now);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = match next_version {
            Some(1) => tx.execute(
                "INSERT INTO module_states (session_id, module_kind, state, version, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT (session_id, module_kind) DO NOTHING",
                params![session.as_str(), kind.as_str(), payload, updated_at],
            )?,
            Some(next) => tx.execute(
                "UPDATE module_states
                 SET state = ?3, version = ?5, updated_at = ?4
                 WHERE session_id = ?1 AND module_kind = ?2 AND version = ?6",
                params![
                    session.as_str(),
                    kind.as_str(),
                    payload,
                    updated_at,
                    next,
                    next - 1
                ],
            )?,
            None => 0,
        };

        let Some(next_version) = next_version.filter(|_| changed > 0) else {
            let stored: Option<i64> = tx
                .query_row(
                    "SELECT version FROM module_states
                     WHERE session_id = ?1 AND module_kind = ?2",
                    params![session.as_str(), kind.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            // Dropping `tx` rolls back; nothing was changed anyway.
            let stored = from_sql_int("module_states", stored.unwrap_or(0))?;
            tracing::debug!(
                session = %session,
                module = %kind,
                expected_version = request.expected_version,
                stored_version = stored,
                "write rejected: version mismatch"
            );
            return Ok(WriteOutcome::Conflict {
                expected_version: stored,
            });
        };

        tx.execute(
            "INSERT INTO state_events (session_id, module_kind, actor_id, version, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.as_str(),
                kind.as_str(),
                actor_id,
                next_version,
                payload,
                updated_at
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            session = %session,
            module = %kind,
            actor = %actor_id,
            version = next_version,
            "state written"
        );

        Ok(WriteOutcome::Committed(Versioned {
            state: request.state,
            version: from_sql_int("module_states", next_version)?,
            updated_at: parse_ts("module_states", &updated_at)?,
        }))
    }

    /// Most recent events first, at most `limit` (clamped to the maximum).
    pub fn history<S: DeserializeOwned>(
        &self,
        session: &SessionKey,
        kind: ModuleKind,
        limit: usize,
    ) -> Result<Vec<StateEvent<S>>, StoreError> {
        let limit = to_sql_int("state_events", clamp_history_limit(Some(limit)) as u64)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, actor_id, version, state, created_at
             FROM state_events
             WHERE session_id = ?1 AND module_kind = ?2
             ORDER BY version DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![session.as_str(), kind.as_str(), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, session_id, actor_id, version, state, created_at) = row?;
            events.push(StateEvent {
                id,
                session_id,
                actor_id,
                version: from_sql_int("state_events", version)?,
                state: serde_json::from_str(&state)?,
                created_at: parse_ts("state_events", &created_at)?,
            });
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
