//! Multi-actor workflows against an in-process service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use benchsync_client::{ActivityFeed, LoopConfig, ModuleSession, SessionConfig, SyncBackend, ViewLoops};
use benchsync_core::module_state::{Scenario, ValuationState};
use benchsync_core::workflow::SyncPhase;
use benchsync_core::{ModuleKind, NewLogEntry, SessionKey, SyncError, WriteOutcome, WriteRequest};
use benchsync_runtime::local::LocalBackend;
use benchsync_runtime::service::{Caller, ServiceConfig, SyncService};

fn caller(session: &str, actor: &str) -> Caller {
    Caller::new(SessionKey::parse(session).unwrap(), Some(actor))
}

fn backend(service: &Arc<SyncService>, session: &str, actor: &str) -> Arc<LocalBackend> {
    Arc::new(LocalBackend::new(Arc::clone(service), caller(session, actor)))
}

fn in_memory() -> Arc<SyncService> {
    Arc::new(SyncService::open_in_memory(ServiceConfig::default()).unwrap())
}

async fn seed_versions(backend: &LocalBackend, count: u64) {
    for version in 0..count {
        backend
            .write_state(
                ModuleKind::Valuation,
                WriteRequest {
                    state: json!({ "scenario": "base", "overrides": { "wacc": 0.08 } }),
                    expected_version: version,
                },
            )
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_writer_reconciles_then_writes_next_version() {
    let service = in_memory();
    let tab_a = backend(&service, "desk", "analyst-a");
    let tab_b = backend(&service, "desk", "analyst-b");
    seed_versions(&tab_a, 3).await;

    let config = SessionConfig::default();
    let a = ModuleSession::<ValuationState, _>::open(Arc::clone(&tab_a), config)
        .await
        .unwrap();
    let b = ModuleSession::<ValuationState, _>::open(Arc::clone(&tab_b), config)
        .await
        .unwrap();
    assert_eq!(a.status().await.known_version, 3);
    assert_eq!(b.status().await.known_version, 3);

    a.edit(|s| s.scenario = Scenario::Bull).await.unwrap();
    a.flush().await.unwrap();
    assert_eq!(a.status().await.known_version, 4);

    // B still believes v3; its write loses and B adopts A's state.
    b.edit(|s| s.scenario = Scenario::Bear).await.unwrap();
    b.flush().await.unwrap();
    let status = b.status().await;
    assert_eq!(status.known_version, 4);
    assert_eq!(status.phase, SyncPhase::Clean);
    let notice = status.notice.expect("reconcile notice");
    assert_eq!(notice.local_version, 3);
    assert_eq!(notice.version, 4);
    assert_eq!(b.snapshot().await.scenario, Scenario::Bull);

    b.edit(|s| {
        s.overrides.insert("growth".into(), 0.04);
    })
    .await
    .unwrap();
    b.flush().await.unwrap();
    assert_eq!(b.status().await.known_version, 5);

    let stored = tab_a
        .load_state(ModuleKind::Valuation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 5);
    assert_eq!(stored.state["scenario"], "bull");
    assert_eq!(stored.state["overrides"]["growth"], 0.04);

    let history = service
        .history(&caller("desk", "analyst-a"), ModuleKind::Valuation, Some(2))
        .unwrap();
    let actors: Vec<&str> = history.iter().map(|e| e.actor_id.as_str()).collect();
    assert_eq!(actors, vec!["analyst-b", "analyst-a"]);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_services_on_one_database_commit_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.db");
    let services: Vec<Arc<SyncService>> = (0..2)
        .map(|_| Arc::new(SyncService::open(&path, ServiceConfig::default()).unwrap()))
        .collect();
    seed_versions(&LocalBackend::new(Arc::clone(&services[0]), caller("desk", "seed")), 1).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let service = Arc::clone(&services[i % 2]);
        tasks.push(tokio::spawn(async move {
            let who = caller("desk", &format!("writer-{i}"));
            service
                .run(move |svc| {
                    svc.write_state(
                        &who,
                        ModuleKind::Valuation,
                        WriteRequest {
                            state: json!({ "scenario": "bear", "overrides": { "wacc": 0.1 + i as f64 / 100.0 } }),
                            expected_version: 1,
                        },
                        Utc::now(),
                    )
                })
                .await
                .unwrap()
        }));
    }

    let mut committed = 0;
    for task in tasks {
        match task.await.unwrap() {
            WriteOutcome::Committed(v) => {
                assert_eq!(v.version, 2);
                committed += 1;
            }
            WriteOutcome::Conflict { expected_version } => assert_eq!(expected_version, 2),
        }
    }
    assert_eq!(committed, 1);

    let history = services[1]
        .history(&caller("desk", "seed"), ModuleKind::Valuation, None)
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_log_keeps_newest_hundred() {
    let service = in_memory();
    let desk = backend(&service, "desk", "analyst-a");
    for i in 0..150 {
        desk.append_log(NewLogEntry::new("memo", "Memo", format!("action-{i}")))
            .await
            .unwrap();
    }

    let entries = desk.fetch_log().await.unwrap();
    assert_eq!(entries.len(), 100);
    assert_eq!(entries[0].action, "action-149");
    assert_eq!(entries[99].action, "action-50");

    // Another session's log is untouched.
    assert!(backend(&service, "other", "x").fetch_log().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feed_and_loops_share_one_backend() {
    let service = in_memory();
    let desk = backend(&service, "desk", "analyst-a");
    let feed = Arc::new(ActivityFeed::new(Arc::clone(&desk)));
    let config = LoopConfig {
        heartbeat_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(50),
    };
    let loops = ViewLoops::start(Arc::clone(&desk), Some(Arc::clone(&feed)), "valuation", config);

    // A second analyst heartbeats on the same stage.
    backend(&service, "elsewhere", "analyst-b")
        .heartbeat("valuation")
        .await
        .unwrap();

    let mut peers = loops.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if peers.borrow_and_update().len() == 2 {
                break;
            }
            peers.changed().await.unwrap();
        }
    })
    .await
    .expect("both analysts visible");

    let shown = feed
        .record(NewLogEntry::new("valuation", "Valuation", "scenario changed").with_details("bull"))
        .await
        .unwrap();
    assert!(shown.is_local());
    assert_eq!(desk.fetch_log().await.unwrap().len(), 1);

    feed.refresh().await.unwrap();
    let entries = feed.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].details.as_deref(), Some("bull"));

    loops.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_payload_never_reaches_the_store() {
    let service = in_memory();
    let desk = backend(&service, "desk", "analyst-a");

    let err = desk
        .write_state(
            ModuleKind::Valuation,
            WriteRequest {
                state: json!({ "scenario": "sideways", "overrides": {} }),
                expected_version: 0,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(desk.load_state(ModuleKind::Valuation).await.unwrap().is_none());
}
