//! Per-session activity log, trimmed to the newest `cap` entries on append.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};

use benchsync_core::activity_log::{normalize_timestamp, truncate_to_millis};
use benchsync_core::{LogEntry, NewLogEntry, SessionKey};

use crate::error::StoreError;
use crate::schema::{open_file, open_memory, to_sql_int};

pub struct LogStore {
    conn: Connection,
    cap: usize,
}

impl LogStore {
    pub fn open(path: &Path, cap: usize) -> Result<Self, StoreError> {
        Ok(Self {
            conn: open_file(path)?,
            cap: cap.max(1),
        })
    }

    pub fn open_in_memory(cap: usize) -> Result<Self, StoreError> {
        Ok(Self {
            conn: open_memory()?,
            cap: cap.max(1),
        })
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Append one entry and drop anything older than the newest `cap` for
    /// this session. The entry keeps the caller's timestamp (at millisecond
    /// precision) when one is given.
    ///
    /// An entry older than every retained row is trimmed by the same append.
    /// It is still returned with its assigned id, but `list` never shows it.
    pub fn append(
        &mut self,
        session: &SessionKey,
        actor_id: &str,
        entry: &NewLogEntry,
        now: DateTime<Utc>,
    ) -> Result<LogEntry, StoreError> {
        let timestamp = truncate_to_millis(entry.timestamp.unwrap_or(now));
        let cap = to_sql_int("activity_log", self.cap as u64)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO activity_log
                (session_id, actor_id, stage_slug, stage_title, action, details, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.as_str(),
                actor_id,
                entry.stage_slug,
                entry.stage_title,
                entry.action,
                entry.details,
                normalize_timestamp(timestamp),
            ],
        )?;
        let id = tx.last_insert_rowid();
        let trimmed = tx.execute(
            "DELETE FROM activity_log
             WHERE session_id = ?1
               AND id NOT IN (
                   SELECT id FROM activity_log
                   WHERE session_id = ?1
                   ORDER BY timestamp_ms DESC, id DESC
                   LIMIT ?2
               )",
            params![session.as_str(), cap],
        )?;
        let retained: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM activity_log WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        if trimmed > 0 {
            tracing::trace!(session = %session, trimmed, "activity log trimmed");
        }
        if !retained {
            tracing::debug!(
                session = %session,
                id,
                action = %entry.action,
                "appended entry is older than the retained window; dropped"
            );
        }

        Ok(LogEntry {
            id: id.to_string(),
            stage_slug: entry.stage_slug.clone(),
            stage_title: entry.stage_title.clone(),
            action: entry.action.clone(),
            details: entry.details.clone(),
            timestamp,
        })
    }

    /// Newest first, at most `cap` entries.
    pub fn list(&self, session: &SessionKey) -> Result<Vec<LogEntry>, StoreError> {
        let cap = to_sql_int("activity_log", self.cap as u64)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, stage_slug, stage_title, action, details, timestamp_ms
             FROM activity_log
             WHERE session_id = ?1
             ORDER BY timestamp_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session.as_str(), cap], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, stage_slug, stage_title, action, details, timestamp_ms) = row?;
            let timestamp =
                DateTime::from_timestamp_millis(timestamp_ms).ok_or(StoreError::Corrupt {
                    table: "activity_log",
                    detail: format!("timestamp out of range: {timestamp_ms}"),
                })?;
            entries.push(LogEntry {
                id: id.to_string(),
                stage_slug,
                stage_title,
                action,
                details,
                timestamp,
            });
        }
        Ok(entries)
    }
}
