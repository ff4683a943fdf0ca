//! Error taxonomy shared by the store, the service, and the workflow client.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Malformed payload. Rejected before any version check.
    #[error("invalid payload: {0}")]
    Validation(String),

    /// The caller's expected version did not match; carries the stored version.
    #[error("version conflict: stored version is {expected_version}")]
    Conflict { expected_version: u64 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("presence unavailable: {0}")]
    Presence(String),
}

impl SyncError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    /// Whether retrying the same call later can succeed without the caller
    /// changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Presence(_))
    }
}
