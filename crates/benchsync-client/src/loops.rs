//! Heartbeat and poll loops for one open view.
//!
//! Both loops run until the view's [`CancellationToken`] is cancelled.
//! Failures are logged at `warn` and retried on the next tick. The latest
//! peer list is published on a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use benchsync_core::PresenceEntry;

use crate::backend::SyncBackend;
use crate::feed::ActivityFeed;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct ViewLoops {
    stage_slug: String,
    cancel: CancellationToken,
    peers: watch::Receiver<Vec<PresenceEntry>>,
    handles: Vec<JoinHandle<()>>,
}

impl ViewLoops {
    /// Start heartbeating on `stage_slug` and polling peers and, when a feed
    /// is given, the activity log.
    pub fn start<B: SyncBackend>(
        backend: Arc<B>,
        feed: Option<Arc<ActivityFeed<B>>>,
        stage_slug: impl Into<String>,
        config: LoopConfig,
    ) -> Self {
        let stage_slug = stage_slug.into();
        let cancel = CancellationToken::new();
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let peers_tx = Arc::new(peers_tx);

        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&backend),
            stage_slug.clone(),
            config.heartbeat_interval,
            Arc::clone(&peers_tx),
            cancel.clone(),
        ));
        let poll = tokio::spawn(run_poll(
            backend,
            feed,
            stage_slug.clone(),
            config.poll_interval,
            peers_tx,
            cancel.clone(),
        ));

        tracing::debug!(stage = %stage_slug, "view loops started");
        Self {
            stage_slug,
            cancel,
            peers: peers_rx,
            handles: vec![heartbeat, poll],
        }
    }

    pub fn stage_slug(&self) -> &str {
        &self.stage_slug
    }

    /// Latest known peers on the stage, the caller included once its first
    /// heartbeat lands.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.peers.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.peers.clone()
    }

    /// Cancel both loops and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(stage = %self.stage_slug, "view loop ended abnormally: {e}");
            }
        }
        tracing::debug!(stage = %self.stage_slug, "view loops stopped");
    }
}

impl Drop for ViewLoops {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_heartbeat<B: SyncBackend>(
    backend: Arc<B>,
    stage_slug: String,
    every: Duration,
    peers: Arc<watch::Sender<Vec<PresenceEntry>>>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match backend.heartbeat(&stage_slug).await {
            Ok(response) => {
                peers.send_replace(response.peers);
            }
            Err(err) => {
                tracing::warn!(stage = %stage_slug, error = %err, "heartbeat failed");
            }
        }
    }
}

async fn run_poll<B: SyncBackend>(
    backend: Arc<B>,
    feed: Option<Arc<ActivityFeed<B>>>,
    stage_slug: String,
    every: Duration,
    peers: Arc<watch::Sender<Vec<PresenceEntry>>>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The heartbeat's first tick already returns the peer list.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match backend.list_peers(&stage_slug).await {
            Ok(list) => {
                peers.send_replace(list);
            }
            Err(err) => {
                tracing::warn!(stage = %stage_slug, error = %err, "peer poll failed");
            }
        }
        if let Some(feed) = &feed {
            if let Err(err) = feed.refresh().await {
                tracing::warn!(stage = %stage_slug, error = %err, "log poll failed");
            }
        }
    }
}
