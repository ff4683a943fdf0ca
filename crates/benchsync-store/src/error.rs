//! Error types for the SQLite stores.

use benchsync_core::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::StoreUnavailable(err.to_string())
    }
}
