//! Closed set of module payloads.
//!
//! The version store treats payloads as opaque JSON. Every payload is decoded
//! into one of the variants below and validated at the boundary before it is
//! handed to the store, so a row can never hold a payload of the wrong shape.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::ModuleKind;

/// A payload type bound to exactly one module kind.
pub trait ModulePayload:
    Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static
{
    const KIND: ModuleKind;

    fn validate(&self) -> Result<(), SyncError>;
}

// ─── Memo ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoState {
    pub sections: Vec<MemoSection>,
    pub checklist: Vec<ChecklistItem>,
    pub attachments: Vec<Attachment>,
    pub comments: Vec<MemoComment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoSection {
    pub id: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChecklistItem {
    pub id: String,
    pub label: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoComment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl ModulePayload for MemoState {
    const KIND: ModuleKind = ModuleKind::Memo;

    fn validate(&self) -> Result<(), SyncError> {
        ensure_unique_ids("sections", self.sections.iter().map(|s| s.id.as_str()))?;
        ensure_unique_ids("checklist", self.checklist.iter().map(|c| c.id.as_str()))?;
        ensure_unique_ids("attachments", self.attachments.iter().map(|a| a.id.as_str()))?;
        ensure_unique_ids("comments", self.comments.iter().map(|c| c.id.as_str()))?;

        let section_ids: HashSet<&str> = self.sections.iter().map(|s| s.id.as_str()).collect();
        for comment in &self.comments {
            if let Some(section_id) = comment.section_id.as_deref() {
                if !section_ids.contains(section_id) {
                    return Err(SyncError::Validation(format!(
                        "comment {} references unknown section {section_id}",
                        comment.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ─── Normalization ────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    #[default]
    Open,
    Resolved,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconciliationFlag {
    pub status: FlagStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Reconciliation flags keyed by normalized line item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NormalizationState {
    pub reconciliation_flags: BTreeMap<String, ReconciliationFlag>,
}

impl ModulePayload for NormalizationState {
    const KIND: ModuleKind = ModuleKind::Normalization;

    fn validate(&self) -> Result<(), SyncError> {
        ensure_non_blank_keys("reconciliationFlags", self.reconciliation_flags.keys())
    }
}

// ─── Valuation ────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Bear,
    #[default]
    Base,
    Bull,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValuationState {
    pub scenario: Scenario,
    /// Assumption overrides keyed by assumption name.
    pub overrides: BTreeMap<String, f64>,
}

impl ModulePayload for ValuationState {
    const KIND: ModuleKind = ModuleKind::Valuation;

    fn validate(&self) -> Result<(), SyncError> {
        ensure_non_blank_keys("overrides", self.overrides.keys())?;
        ensure_finite("overrides", &self.overrides)
    }
}

// ─── Monitoring ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MonitoringState {
    /// Alert ids the session has acknowledged.
    pub acknowledged: BTreeSet<String>,
    /// Metric deltas since the last review, keyed by metric.
    pub deltas: BTreeMap<String, f64>,
}

impl ModulePayload for MonitoringState {
    const KIND: ModuleKind = ModuleKind::Monitoring;

    fn validate(&self) -> Result<(), SyncError> {
        ensure_non_blank_keys("acknowledged", self.acknowledged.iter())?;
        ensure_non_blank_keys("deltas", self.deltas.keys())?;
        ensure_finite("deltas", &self.deltas)
    }
}

// ─── Tagged union ─────────────────────────────────────────────────

/// A validated payload of any module kind. Serializes as the bare payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModuleState {
    Memo(MemoState),
    Normalization(NormalizationState),
    Valuation(ValuationState),
    Monitoring(MonitoringState),
}

impl ModuleState {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Memo(_) => ModuleKind::Memo,
            Self::Normalization(_) => ModuleKind::Normalization,
            Self::Valuation(_) => ModuleKind::Valuation,
            Self::Monitoring(_) => ModuleKind::Monitoring,
        }
    }

    /// Decode and validate a raw payload as the given module kind.
    pub fn parse(kind: ModuleKind, value: serde_json::Value) -> Result<Self, SyncError> {
        match kind {
            ModuleKind::Memo => decode_payload::<MemoState>(value).map(Self::Memo),
            ModuleKind::Normalization => {
                decode_payload::<NormalizationState>(value).map(Self::Normalization)
            }
            ModuleKind::Valuation => decode_payload::<ValuationState>(value).map(Self::Valuation),
            ModuleKind::Monitoring => decode_payload::<MonitoringState>(value).map(Self::Monitoring),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, SyncError> {
        serde_json::to_value(self).map_err(|e| SyncError::Validation(e.to_string()))
    }
}

/// Decode and validate a raw payload as `P`.
pub fn decode_payload<P: ModulePayload>(value: serde_json::Value) -> Result<P, SyncError> {
    let payload: P = serde_json::from_value(value)
        .map_err(|e| SyncError::Validation(format!("{} payload: {e}", P::KIND)))?;
    payload.validate()?;
    Ok(payload)
}

fn ensure_unique_ids<'a>(
    list: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), SyncError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(SyncError::Validation(format!("{list}: id must not be empty")));
        }
        if !seen.insert(id) {
            return Err(SyncError::Validation(format!("{list}: duplicate id {id}")));
        }
    }
    Ok(())
}

fn ensure_non_blank_keys<'a>(
    field: &str,
    keys: impl Iterator<Item = &'a String>,
) -> Result<(), SyncError> {
    for key in keys {
        if key.trim().is_empty() {
            return Err(SyncError::Validation(format!("{field}: key must not be empty")));
        }
    }
    Ok(())
}

fn ensure_finite(field: &str, values: &BTreeMap<String, f64>) -> Result<(), SyncError> {
    match values.iter().find(|(_, v)| !v.is_finite()) {
        Some((key, _)) => Err(SyncError::Validation(format!(
            "{field}: {key} is not a finite number"
        ))),
        None => Ok(()),
    }
}
