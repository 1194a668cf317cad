/*
    sync_tests.rs - Conflict strategies, retries and the offline queue
*/

use super::ErrorLog;
use crate::config::{Config, StrategyKind};
use crate::store::snapshot::now_millis;
use crate::store::{SetOptions, Store};
use crate::sync::{
    ConflictStrategy, KeyState, MemoryRemote, PushAck, PushRequest, RemoteVersion, Resolution, SyncError, SyncRemote,
    SyncReport, SyncResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Delays every version fetch so a cycle stays in flight
struct SlowRemote {
    inner: Arc<MemoryRemote>,
    delay: Duration,
}

#[async_trait]
impl SyncRemote for SlowRemote {
    async fn fetch_versions(&self, keys: &[String]) -> SyncResult<HashMap<String, RemoteVersion>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_versions(keys).await
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
        self.inner.push(request).await
    }
}

/// Timers never fire on their own inside a test; cycles run through `sync()`
fn sync_config(namespace: &str) -> Config {
    let mut config = Config::with_namespace(namespace);
    config.sync.debounce = Duration::from_secs(60);
    config.sync.retry_delay = Duration::from_millis(1);
    config
}

fn synced(namespace: &str, remote: &Arc<MemoryRemote>, strategy: ConflictStrategy) -> Store {
    Store::builder(sync_config(namespace)).remote_arc(remote.clone()).strategy(strategy).build().unwrap()
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_first_push_creates_the_remote_record() {
    let remote = Arc::new(MemoryRemote::new());
    let store = synced("sync-first", &remote, ConflictStrategy::default());

    store.set("x", json!(1)).unwrap();
    assert_eq!(store.key_state("x"), KeyState::Pending);
    assert_eq!(store.pending_changes().len(), 1);

    let report = store.sync().await.unwrap();
    assert_eq!(report.pushed, vec!["x"]);
    assert!(report.conflicts.is_empty());
    assert!(report.is_clean());

    assert_eq!(remote.get("x").unwrap().value, json!(1));
    assert_eq!(store.remote_version("x").unwrap().version, 1);
    assert_eq!(store.key_state("x"), KeyState::Clean);
    assert!(store.pending_changes().is_empty());
}

#[tokio::test]
async fn test_accept_remote_overwrites_local() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("x", 2, 0, json!("R"));
    let store = synced("sync-accept-remote", &remote, ConflictStrategy::AcceptRemote);

    store.set("x", json!("L")).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(*store.get("x").unwrap(), json!("R"));
    assert_eq!(store.version("x"), 2);
    assert!(store.pending_changes().is_empty());
    assert_eq!(store.key_state("x"), KeyState::Clean);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].1, Resolution::TakeRemote);
    assert_eq!(report.conflicts[0].0.local_value, json!("L"));
    assert_eq!(remote.push_count(), 0);
}

#[tokio::test]
async fn test_accept_local_pushes_past_the_remote() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("x", 2, 0, json!("R"));
    let store = synced("sync-accept-local", &remote, ConflictStrategy::AcceptLocal);

    store.set("x", json!("L")).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(report.pushed, vec!["x"]);
    let record = remote.get("x").unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.value, json!("L"));
    assert_eq!(store.version("x"), 3);
    assert_eq!(*store.get("x").unwrap(), json!("L"));
}

#[tokio::test]
async fn test_merge_writes_and_pushes_the_merged_value() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("x", 2, 0, json!("R"));

    let mut config = sync_config("sync-merge");
    config.sync.strategy = StrategyKind::Merge;
    let store = Store::builder(config)
        .remote_arc(remote.clone())
        .merge(|info| {
            json!(format!(
                "{}+{}",
                info.local_value.as_str().unwrap_or_default(),
                info.remote_value.as_str().unwrap_or_default()
            ))
        })
        .build()
        .unwrap();

    store.set("x", json!("L")).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(*store.get("x").unwrap(), json!("L+R"));
    assert_eq!(store.version("x"), 3);
    let record = remote.get("x").unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.value, json!("L+R"));
    assert_eq!(report.conflicts[0].1, Resolution::Merged(json!("L+R")));
    assert!(store.pending_changes().is_empty());
}

#[test]
fn test_merge_strategy_requires_a_function() {
    let mut config = sync_config("sync-merge-missing");
    config.sync.strategy = StrategyKind::Merge;
    let result = Store::builder(config).remote(MemoryRemote::new()).build();
    assert!(matches!(result, Err(crate::store::StoreError::Config(_))));
}

#[tokio::test]
async fn test_discard_leaves_the_key_conflicted() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("x", 2, 0, json!("R"));
    let store = synced("sync-discard", &remote, ConflictStrategy::Discard);

    store.set("x", json!("L")).unwrap();
    store.sync().await.unwrap();

    assert_eq!(store.key_state("x"), KeyState::Conflicted);
    assert_eq!(*store.get("x").unwrap(), json!("L"));
    assert_eq!(remote.get("x").unwrap().value, json!("R"));
    assert!(store.pending_changes().is_empty());

    // A new local write queues it again
    store.set("x", json!("L2")).unwrap();
    assert_eq!(store.key_state("x"), KeyState::Pending);
}

#[tokio::test]
async fn test_last_write_wins_compares_timestamps() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("stale", 5, 1, json!("remote-old"));
    remote.insert("fresh", 5, now_millis() + 3_600_000, json!("remote-new"));
    let store = synced("sync-lww", &remote, ConflictStrategy::LastWriteWins);

    store.set("stale", json!("local")).unwrap();
    store.set("fresh", json!("local")).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(report.conflicts.len(), 2);
    assert_eq!(remote.get("stale").unwrap().value, json!("local"));
    assert_eq!(remote.get("stale").unwrap().version, 6);
    assert_eq!(*store.get("fresh").unwrap(), json!("remote-new"));
    assert_eq!(store.version("fresh"), 5);
}

#[tokio::test]
async fn test_transient_push_failures_are_retried() {
    let remote = Arc::new(MemoryRemote::new());
    let store = synced("sync-retry", &remote, ConflictStrategy::default());
    remote.fail_next_pushes(2);

    store.set("x", json!(1)).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(report.pushed, vec!["x"]);
    assert_eq!(remote.push_count(), 3);
    assert_eq!(store.key_state("x"), KeyState::Clean);
}

#[tokio::test]
async fn test_exhausted_retries_keep_the_change_pending() {
    let errors = ErrorLog::new();
    let remote = Arc::new(MemoryRemote::new());
    let store = Store::builder(sync_config("sync-exhausted"))
        .remote_arc(remote.clone())
        .on_error(errors.handler())
        .build()
        .unwrap();
    remote.fail_next_pushes(10);

    store.set("x", json!(1)).unwrap();
    let report = store.sync().await.unwrap();

    assert!(!report.is_clean());
    assert!(matches!(report.errors[0].error, SyncError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(remote.push_count(), 4);
    assert_eq!(store.key_state("x"), KeyState::Pending);
    assert_eq!(errors.operations(), vec!["sync"]);
    assert_eq!(errors.contexts()[0].key.as_deref(), Some("x"));

    // The next cycle picks it up again
    remote.fail_next_pushes(0);
    let report = store.sync().await.unwrap();
    assert_eq!(report.pushed, vec!["x"]);
}

#[tokio::test]
async fn test_unreachable_remote_fails_every_key() {
    let remote = Arc::new(MemoryRemote::new());
    let store = synced("sync-unreachable", &remote, ConflictStrategy::default());
    remote.set_offline(true);

    store.set("a", json!(1)).unwrap();
    store.set("b", json!(2)).unwrap();
    let report = store.sync().await.unwrap();

    let failed: Vec<&str> = report.errors.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(failed, vec!["a", "b"]);
    assert_eq!(store.key_state("a"), KeyState::Pending);
    assert_eq!(store.pending_changes().len(), 2);
}

#[tokio::test]
async fn test_offline_changes_sync_when_back_online() {
    let remote = Arc::new(MemoryRemote::new());
    let store = synced("sync-offline", &remote, ConflictStrategy::default());

    store.set_online(false);
    assert!(!store.is_online());
    store.set("draft", json!("written offline")).unwrap();
    assert!(matches!(store.sync().await, Err(SyncError::Offline)));
    assert_eq!(store.pending_changes().len(), 1);

    store.set_online(true);
    assert!(eventually(|| remote.get("draft").is_some()).await);
    assert!(eventually(|| store.pending_changes().is_empty()).await);
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let inner = Arc::new(MemoryRemote::new());
    let store = Store::builder(sync_config("sync-concurrent"))
        .remote(SlowRemote { inner: inner.clone(), delay: Duration::from_millis(50) })
        .build()
        .unwrap();
    store.set("x", json!(1)).unwrap();

    let (first, second) = tokio::join!(store.sync(), store.sync());
    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::AlreadySyncing)));
    assert!(!store.is_syncing());
    assert_eq!(inner.get("x").unwrap().version, 1);
}

#[tokio::test]
async fn test_write_during_cycle_stays_pending() {
    let inner = Arc::new(MemoryRemote::new());
    let store = Store::builder(sync_config("sync-inflight"))
        .remote(SlowRemote { inner: inner.clone(), delay: Duration::from_millis(50) })
        .build()
        .unwrap();
    store.set("x", json!(1)).unwrap();

    let (report, _) = tokio::join!(store.sync(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set("x", json!(2)).unwrap();
    });
    assert_eq!(report.unwrap().pushed, vec!["x"]);
    assert_eq!(inner.get("x").unwrap().value, json!(1));

    let pending = store.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].local_version, 2);
    assert_eq!(*pending[0].value(), json!(2));
    assert_eq!(store.key_state("x"), KeyState::Pending);

    store.sync().await.unwrap();
    assert_eq!(inner.get("x").unwrap().value, json!(2));
}

/// Remote holds x@5 "R"; "L2" lands while the cycle for "L1" is fetching
async fn write_during_conflicting_cycle(namespace: &str, strategy: ConflictStrategy) -> (Store, Arc<MemoryRemote>) {
    let inner = Arc::new(MemoryRemote::new());
    inner.insert("x", 5, 0, json!("R"));
    let store = Store::builder(sync_config(namespace))
        .remote(SlowRemote { inner: inner.clone(), delay: Duration::from_millis(50) })
        .strategy(strategy)
        .build()
        .unwrap();
    store.set("x", json!("L1")).unwrap();

    let (report, _) = tokio::join!(store.sync(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set("x", json!("L2")).unwrap();
    });
    let report = report.unwrap();
    assert!(report.conflicts.is_empty());
    assert!(report.pushed.is_empty());
    (store, inner)
}

#[tokio::test]
async fn test_accept_remote_keeps_write_made_during_cycle() {
    let (store, inner) = write_during_conflicting_cycle("sync-inflight-remote", ConflictStrategy::AcceptRemote).await;

    assert_eq!(*store.get("x").unwrap(), json!("L2"));
    let pending = store.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(*pending[0].value(), json!("L2"));
    assert_eq!(store.key_state("x"), KeyState::Pending);

    // The newer change is resolved on its own cycle
    let report = store.sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].0.local_value, json!("L2"));
    assert_eq!(*store.get("x").unwrap(), json!("R"));
    assert_eq!(store.key_state("x"), KeyState::Clean);
    assert_eq!(inner.push_count(), 0);
}

#[tokio::test]
async fn test_discard_keeps_write_made_during_cycle_queued() {
    let (store, _inner) = write_during_conflicting_cycle("sync-inflight-discard", ConflictStrategy::Discard).await;

    assert_eq!(*store.get("x").unwrap(), json!("L2"));
    assert_eq!(store.pending_changes().len(), 1);
    assert_eq!(store.key_state("x"), KeyState::Pending);

    let report = store.sync().await.unwrap();
    assert_eq!(report.conflicts[0].1, Resolution::Discarded);
    assert_eq!(report.conflicts[0].0.local_value, json!("L2"));
    assert!(store.pending_changes().is_empty());
    assert_eq!(store.key_state("x"), KeyState::Conflicted);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_rearms_on_each_write() {
    let remote = Arc::new(MemoryRemote::new());
    let mut config = sync_config("sync-debounce");
    config.sync.debounce = Duration::from_millis(100);
    let store = Store::builder(config).remote_arc(remote.clone()).build().unwrap();

    store.set("x", json!(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    store.set("x", json!(2)).unwrap();

    // First deadline (100ms) was cancelled by the second write
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(remote.push_count(), 0);
    assert_eq!(store.key_state("x"), KeyState::Pending);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(remote.push_count(), 1);
    assert_eq!(remote.get("x").unwrap().value, json!(2));
    assert_eq!(store.key_state("x"), KeyState::Clean);
}

#[tokio::test]
async fn test_completion_callback_sees_each_report() {
    let remote = Arc::new(MemoryRemote::new());
    let reports: Arc<Mutex<Vec<SyncReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let store = Store::builder(sync_config("sync-callback"))
        .remote_arc(remote.clone())
        .on_sync_complete(move |report| sink.lock().push(report.clone()))
        .build()
        .unwrap();

    store.set("a", json!(1)).unwrap();
    store.sync().await.unwrap();
    store.sync().await.unwrap();

    let reports = reports.lock();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].pushed, vec!["a"]);
    assert!(reports[1].pushed.is_empty());
}

#[tokio::test]
async fn test_only_tracked_local_writes_are_queued() {
    let remote = Arc::new(MemoryRemote::new());
    let mut config = sync_config("sync-filter");
    config.sync.keys = Some(vec![r"^user\.".to_string()]);
    let store = Store::builder(config).remote_arc(remote.clone()).build().unwrap();

    store.set("ui.theme", json!("dark")).unwrap();
    store.set("user.name", json!("ada")).unwrap();
    store.set_with("user.draft", json!("wip"), SetOptions::new().sync(false)).unwrap();
    store.set("user.temp", json!(true)).unwrap();
    store.remove("user.temp");

    let keys: Vec<String> = store.pending_changes().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec!["user.name"]);
}

#[tokio::test]
async fn test_sync_requires_an_engine() {
    let store = Store::in_memory("sync-none").unwrap();
    assert!(matches!(store.sync().await, Err(SyncError::NotConfigured)));
    assert!(store.is_online());
    assert_eq!(store.key_state("anything"), KeyState::Clean);
}
