//! Stage presence registry.
//!
//! Tracks which actors currently have a stage open. Entries are refreshed by
//! heartbeats and pruned lazily on access; there is no background sweeper.
//! The registry is process-local: separate service instances each hold their
//! own view of presence.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::types::PresenceEntry;

// ─── Constants ───────────────────────────────────────────────────────

/// Entries older than this are never returned (45 seconds).
pub const DEFAULT_PRESENCE_TTL_SECS: i64 = 45;

// ─── Registry ────────────────────────────────────────────────────────

/// In-memory presence map: stage slug → actor id → last heartbeat.
#[derive(Debug)]
pub struct PresenceRegistry {
    stages: HashMap<String, HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl PresenceRegistry {
    /// Create a registry with the default 45s TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_PRESENCE_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            stages: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a heartbeat and return every live peer on the stage, the caller
    /// included.
    pub fn heartbeat(
        &mut self,
        stage_slug: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<PresenceEntry> {
        self.prune_stage(stage_slug, now);
        self.stages
            .entry(stage_slug.to_owned())
            .or_default()
            .insert(actor_id.to_owned(), now);
        self.snapshot(stage_slug)
    }

    /// Live peers on the stage. Never refreshes any entry.
    pub fn list_peers(&mut self, stage_slug: &str, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        self.prune_stage(stage_slug, now);
        self.snapshot(stage_slug)
    }

    /// Number of stages with at least one live entry as of the last access.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Drop expired entries for one stage; drop the stage once empty.
    fn prune_stage(&mut self, stage_slug: &str, now: DateTime<Utc>) {
        let ttl = self.ttl;
        let emptied = match self.stages.get_mut(stage_slug) {
            Some(actors) => {
                actors.retain(|_, updated_at| now.signed_duration_since(*updated_at) <= ttl);
                actors.is_empty()
            }
            None => false,
        };
        if emptied {
            self.stages.remove(stage_slug);
        }
    }

    /// Entries for a stage, sorted by actor id.
    fn snapshot(&self, stage_slug: &str) -> Vec<PresenceEntry> {
        let Some(actors) = self.stages.get(stage_slug) else {
            return Vec::new();
        };
        let mut peers: Vec<PresenceEntry> = actors
            .iter()
            .map(|(actor_id, updated_at)| PresenceEntry {
                stage_slug: stage_slug.to_owned(),
                actor_id: actor_id.clone(),
                updated_at: *updated_at,
            })
            .collect();
        peers.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
        peers
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
