//! Activity-log reconciliation.
//!
//! Merges entries created optimistically on the client with the confirmed
//! list returned by the server. Local and confirmed copies of the same event
//! carry different ids, so identity is by content: stage, action, details,
//! and the timestamp (truncated to milliseconds). The client must submit the
//! exact timestamp it stamped on the optimistic entry.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::types::LogEntry;

/// Maximum number of entries kept in any merged view.
pub const LOG_CAP: usize = 100;

/// Content identity of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub stage_slug: String,
    pub action: String,
    pub details: Option<String>,
    pub timestamp_ms: i64,
}

impl LogKey {
    pub fn of(entry: &LogEntry) -> Self {
        Self {
            stage_slug: entry.stage_slug.clone(),
            action: entry.action.clone(),
            details: entry.details.clone(),
            timestamp_ms: normalize_timestamp(entry.timestamp),
        }
    }
}

/// Millisecond precision, so a timestamp that round-trips through RFC 3339
/// text or an integer column still produces the same key.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Truncate a timestamp to millisecond precision.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Merge local and remote entries: local first, first occurrence wins,
/// newest first, at most `cap` entries.
pub fn merge_entries(local: &[LogEntry], remote: &[LogEntry], cap: usize) -> Vec<LogEntry> {
    let mut seen: HashSet<LogKey> = HashSet::with_capacity(local.len() + remote.len());
    let mut merged: Vec<LogEntry> = local
        .iter()
        .chain(remote.iter())
        .filter(|entry| seen.insert(LogKey::of(entry)))
        .cloned()
        .collect();

    // Stable, so ties keep local-before-remote order.
    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    merged.truncate(cap);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_750_000_000_000 + ms).unwrap()
    }

    fn entry(id: &str, action: &str, ms: i64) -> LogEntry {
        LogEntry {
            id: id.to_owned(),
            stage_slug: "memo".to_owned(),
            stage_title: "Memo".to_owned(),
            action: action.to_owned(),
            details: None,
            timestamp: at(ms),
        }
    }

    #[test]
    fn local_copy_wins_over_server_echo() {
        let local = vec![entry("local-a", "edited", 10)];
        let remote = vec![entry("17", "edited", 10), entry("16", "opened", 5)];

        let merged = merge_entries(&local, &remote, LOG_CAP);
        let ids: Vec<&str> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["local-a", "16"]);
    }

    #[test]
    fn sub_millisecond_difference_is_same_event() {
        let mut local = entry("local-a", "edited", 10);
        local.timestamp += chrono::Duration::microseconds(400);
        let remote = entry("17", "edited", 10);

        let merged = merge_entries(&[local], &[remote], LOG_CAP);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "local-a");
    }

    #[test]
    fn details_distinguish_entries() {
        let mut a = entry("1", "flagged", 10);
        a.details = Some("revenue".into());
        let mut b = entry("2", "flagged", 10);
        b.details = Some("cogs".into());

        assert_eq!(merge_entries(&[], &[a, b], LOG_CAP).len(), 2);
    }

    #[test]
    fn sorted_newest_first() {
        let remote = vec![entry("1", "a", 1), entry("3", "c", 3), entry("2", "b", 2)];
        let merged = merge_entries(&[], &remote, LOG_CAP);
        let ids: Vec<&str> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
    }

    #[test]
    fn keeps_the_hundred_most_recent_of_150() {
        let remote: Vec<LogEntry> = (0..150)
            .map(|i| entry(&i.to_string(), &format!("action-{i}"), i))
            .collect();
        let merged = merge_entries(&[], &remote, LOG_CAP);
        assert_eq!(merged.len(), 100);
        assert_eq!(merged[0].id, "149");
        assert_eq!(merged[99].id, "50");
    }

    #[test]
    fn merging_same_batch_twice_is_idempotent() {
        let local = vec![entry("local-x", "edited", 7)];
        let remote = vec![entry("1", "opened", 1), entry("2", "edited", 7)];

        let once = merge_entries(&local, &remote, LOG_CAP);
        let twice = merge_entries(&once, &remote, LOG_CAP);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncate_drops_sub_millisecond_part() {
        let ts = at(5) + chrono::Duration::microseconds(250);
        assert_eq!(truncate_to_millis(ts), at(5));
    }

    fn arb_entry() -> impl Strategy<Value = LogEntry> {
        (0u8..4, 0u8..3, 0i64..40, any::<bool>()).prop_map(|(stage, action, ms, local)| {
            let prefix = if local { "local-" } else { "" };
            LogEntry {
                id: format!("{prefix}{stage}-{action}-{ms}"),
                stage_slug: format!("stage-{stage}"),
                stage_title: format!("Stage {stage}"),
                action: format!("action-{action}"),
                details: None,
                timestamp: at(ms),
            }
        })
    }

    proptest! {
        #[test]
        fn merge_invariants(
            local in proptest::collection::vec(arb_entry(), 0..60),
            remote in proptest::collection::vec(arb_entry(), 0..120),
        ) {
            let merged = merge_entries(&local, &remote, LOG_CAP);

            prop_assert!(merged.len() <= LOG_CAP);
            prop_assert!(merged.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

            let keys: HashSet<LogKey> = merged.iter().map(LogKey::of).collect();
            prop_assert_eq!(keys.len(), merged.len());

            let again = merge_entries(&merged, &remote, LOG_CAP);
            prop_assert_eq!(again, merged);
        }
    }
}
