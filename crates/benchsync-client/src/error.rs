use benchsync_core::SyncError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Two conflicts in a row. Nothing is retried until `acknowledge()`.
    #[error("module is blocked after repeated conflicts; acknowledge to reconcile")]
    Blocked,
}

impl ClientError {
    pub fn as_sync(&self) -> Option<&SyncError> {
        match self {
            Self::Sync(err) => Some(err),
            Self::Blocked => None,
        }
    }
}
