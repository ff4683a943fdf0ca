use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

// ─── Session & Module ─────────────────────────────────────────────

/// Opaque identifier for one client context (not a user account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Accepts any non-blank string; surrounding whitespace is dropped.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SyncError::validation("session key must not be empty"));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// For keys produced internally that are known to be non-blank.
    pub(crate) fn from_generated(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Memo,
    Normalization,
    Valuation,
    Monitoring,
}

impl ModuleKind {
    pub const ALL: [Self; 4] = [
        Self::Memo,
        Self::Normalization,
        Self::Valuation,
        Self::Monitoring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memo => "memo",
            Self::Normalization => "normalization",
            Self::Valuation => "valuation",
            Self::Monitoring => "monitoring",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memo" => Ok(Self::Memo),
            "normalization" => Ok(Self::Normalization),
            "valuation" => Ok(Self::Valuation),
            "monitoring" => Ok(Self::Monitoring),
            _ => Err(SyncError::Validation(format!("unknown module kind: {s}"))),
        }
    }
}

// ─── Versioned state ──────────────────────────────────────────────

/// Current state of one (session, module) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned<S> {
    pub state: S,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Compare-and-swap write request. `expected_version` is 0 for a first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest<S> {
    pub state: S,
    pub expected_version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<S> {
    Committed(Versioned<S>),
    /// Nothing was written; `expected_version` is the authoritative stored version.
    Conflict { expected_version: u64 },
}

impl<S> WriteOutcome<S> {
    pub fn into_result(self) -> Result<Versioned<S>, SyncError> {
        match self {
            Self::Committed(versioned) => Ok(versioned),
            Self::Conflict { expected_version } => Err(SyncError::Conflict { expected_version }),
        }
    }
}

/// Immutable history record, one per accepted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent<S> {
    pub id: i64,
    pub session_id: String,
    pub actor_id: String,
    pub version: u64,
    pub state: S,
    pub created_at: DateTime<Utc>,
}

// ─── Presence ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub stage_slug: String,
    pub actor_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub actor_id: String,
    pub stage_slug: String,
    pub updated_at: DateTime<Utc>,
    pub peers: Vec<PresenceEntry>,
}

// ─── Activity log ─────────────────────────────────────────────────

/// Id prefix for entries created client-side before confirmation.
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub stage_slug: String,
    pub stage_title: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Append request. A missing `timestamp` is filled in by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLogEntry {
    pub stage_slug: String,
    pub stage_title: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewLogEntry {
    pub fn new(
        stage_slug: impl Into<String>,
        stage_title: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            stage_slug: stage_slug.into(),
            stage_title: stage_title.into(),
            action: action.into(),
            details: None,
            timestamp: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for (field, value) in [
            ("stageSlug", &self.stage_slug),
            ("stageTitle", &self.stage_title),
            ("action", &self.action),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::Validation(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}
