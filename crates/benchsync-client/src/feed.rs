//! Optimistic activity feed.
//!
//! Entries recorded here show up immediately under a local id and are sent
//! to the server with the same timestamp, so the confirmed copy collapses
//! into the local one when the two lists are merged. Submissions that fail
//! are queued and resent on the next `record` or `refresh`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;

use benchsync_core::activity_log::{LOG_CAP, merge_entries, normalize_timestamp, truncate_to_millis};
use benchsync_core::types::LOCAL_ID_PREFIX;
use benchsync_core::{LogEntry, NewLogEntry, SyncError};

use crate::backend::SyncBackend;

#[derive(Default)]
struct Buffers {
    local: Vec<LogEntry>,
    remote: Vec<LogEntry>,
    /// Failed submissions, oldest first, timestamps already fixed.
    unsent: Vec<NewLogEntry>,
}

pub struct ActivityFeed<B> {
    backend: Arc<B>,
    buffers: Mutex<Buffers>,
    next_local: AtomicU64,
    cap: usize,
}

impl<B: SyncBackend> ActivityFeed<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_cap(backend, LOG_CAP)
    }

    pub fn with_cap(backend: Arc<B>, cap: usize) -> Self {
        Self {
            backend,
            buffers: Mutex::new(Buffers::default()),
            next_local: AtomicU64::new(1),
            cap: cap.max(1),
        }
    }

    /// Show `entry` locally and submit it. A failed submit is logged, the
    /// local entry stays in the feed, and the entry is queued for resending.
    pub async fn record(&self, entry: NewLogEntry) -> Result<LogEntry, SyncError> {
        entry.validate()?;
        let timestamp = truncate_to_millis(entry.timestamp.unwrap_or_else(Utc::now));
        let seq = self.next_local.fetch_add(1, Ordering::Relaxed);
        let local = LogEntry {
            id: format!(
                "{LOCAL_ID_PREFIX}{}-{seq}",
                normalize_timestamp(timestamp)
            ),
            stage_slug: entry.stage_slug.clone(),
            stage_title: entry.stage_title.clone(),
            action: entry.action.clone(),
            details: entry.details.clone(),
            timestamp,
        };

        {
            let mut buffers = self.buffers.lock().await;
            buffers.local.insert(0, local.clone());
            // Newest by timestamp survive the cap, not the latest recorded.
            buffers.local.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            buffers.local.truncate(self.cap);
        }

        self.resend_unsent().await;

        let submit = NewLogEntry {
            timestamp: Some(timestamp),
            ..entry
        };
        match self.backend.append_log(submit.clone()).await {
            Ok(confirmed) => self.confirm(confirmed).await,
            Err(err) => {
                tracing::warn!(
                    stage = %local.stage_slug,
                    action = %local.action,
                    error = %err,
                    "log append failed; queued for retry"
                );
                let mut buffers = self.buffers.lock().await;
                buffers.unsent.push(submit);
                let overflow = buffers.unsent.len().saturating_sub(self.cap);
                buffers.unsent.drain(..overflow);
            }
        }
        Ok(local)
    }

    /// Resend queued entries, then replace the confirmed list with the
    /// server's and return the merged view.
    pub async fn refresh(&self) -> Result<Vec<LogEntry>, SyncError> {
        self.resend_unsent().await;
        let remote = self.backend.fetch_log().await?;
        let mut buffers = self.buffers.lock().await;
        buffers.remote = remote;
        Ok(merge_entries(&buffers.local, &buffers.remote, self.cap))
    }

    /// Entries recorded here that the server has not confirmed yet.
    pub async fn unsent(&self) -> usize {
        self.buffers.lock().await.unsent.len()
    }

    async fn confirm(&self, confirmed: LogEntry) {
        let mut buffers = self.buffers.lock().await;
        let merged = merge_entries(&[confirmed], &buffers.remote, self.cap);
        buffers.remote = merged;
    }

    /// Oldest first; stops at the first failure and keeps the rest queued.
    async fn resend_unsent(&self) {
        let mut queued = std::mem::take(&mut self.buffers.lock().await.unsent).into_iter();
        while let Some(entry) = queued.next() {
            match self.backend.append_log(entry.clone()).await {
                Ok(confirmed) => self.confirm(confirmed).await,
                Err(err) => {
                    tracing::debug!(action = %entry.action, error = %err, "log resend failed");
                    let mut buffers = self.buffers.lock().await;
                    let mut rest: Vec<NewLogEntry> = std::iter::once(entry).chain(queued).collect();
                    rest.append(&mut buffers.unsent);
                    buffers.unsent = rest;
                    return;
                }
            }
        }
    }

    /// Local entries first on ties, deduplicated by content, newest first.
    pub async fn entries(&self) -> Vec<LogEntry> {
        let buffers = self.buffers.lock().await;
        merge_entries(&buffers.local, &buffers.remote, self.cap)
    }
}
