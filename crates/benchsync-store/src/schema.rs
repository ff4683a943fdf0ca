//! Connection setup and schema shared by both stores.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::StoreError;

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open_file(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Readers do not block the writer under WAL.
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    migrate(&conn)?;
    Ok(conn)
}

pub(crate) fn open_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

/// Create the schema if it does not already exist.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS module_states (
            session_id   TEXT NOT NULL,
            module_kind  TEXT NOT NULL,
            state        TEXT NOT NULL,
            version      INTEGER NOT NULL CHECK (version >= 1),
            updated_at   TEXT NOT NULL,
            PRIMARY KEY (session_id, module_kind)
        );
        CREATE TABLE IF NOT EXISTS state_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            module_kind  TEXT NOT NULL,
            actor_id     TEXT NOT NULL,
            version      INTEGER NOT NULL,
            state        TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            UNIQUE (session_id, module_kind, version)
        );
        CREATE TABLE IF NOT EXISTS activity_log (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            actor_id     TEXT NOT NULL,
            stage_slug   TEXT NOT NULL,
            stage_title  TEXT NOT NULL,
            action       TEXT NOT NULL,
            details      TEXT,
            timestamp_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_log_session_time
            ON activity_log (session_id, timestamp_ms DESC, id DESC);",
    )?;
    Ok(())
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

pub(crate) fn to_sql_int(table: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("{value} does not fit in an INTEGER column"),
    })
}

pub(crate) fn from_sql_int(table: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("negative value {value}"),
    })
}
