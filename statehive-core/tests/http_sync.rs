//! End-to-end sync against the HTTP harness
//!
//! Each test binds the reference remote on an ephemeral port and points a
//! store at it through `sync.endpoint`, so the full client path
//! (`HttpRemote` -> axum handlers -> `MemoryRemote`) is exercised.

use serde_json::json;
use statehive_core::config::StrategyKind;
use statehive_core::sync::harness::HarnessServer;
use statehive_core::sync::{KeyState, PushRequest, SyncRemote};
use statehive_core::{Config, HttpRemote, MemoryRemote, Store, SyncError};
use std::sync::Arc;
use std::time::Duration;

async fn spawn_harness(remote: Arc<MemoryRemote>) -> String {
    let server = HarnessServer::bind(remote, "127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("http://{}", addr)
}

fn client(namespace: &str, endpoint: &str, strategy: StrategyKind) -> Store {
    let mut config = Config::with_namespace(namespace);
    config.sync.enabled = true;
    config.sync.endpoint = Some(endpoint.to_string());
    config.sync.strategy = strategy;
    config.sync.debounce = Duration::from_secs(60);
    config.sync.retry_delay = Duration::from_millis(1);
    Store::new(config).unwrap()
}

#[tokio::test]
async fn test_push_over_http() {
    let remote = Arc::new(MemoryRemote::new());
    let endpoint = spawn_harness(remote.clone()).await;
    let store = client("http-push", &endpoint, StrategyKind::LastWriteWins);

    store.set("profile", json!({"name": "Ada"})).unwrap();
    store.set("theme", json!("dark")).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(report.pushed, vec!["profile", "theme"]);
    assert_eq!(remote.get("profile").unwrap().value, json!({"name": "Ada"}));
    assert_eq!(remote.len(), 2);
    assert_eq!(store.key_state("theme"), KeyState::Clean);
}

#[tokio::test]
async fn test_remote_wins_over_http() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("counter", 5, 0, json!(41));
    let endpoint = spawn_harness(remote.clone()).await;
    let store = client("http-remote-wins", &endpoint, StrategyKind::AcceptRemote);

    store.set("counter", json!(1)).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(*store.get("counter").unwrap(), json!(41));
    assert_eq!(store.version("counter"), 5);
    assert!(store.pending_changes().is_empty());
}

#[tokio::test]
async fn test_two_clients_through_one_remote() {
    let remote = Arc::new(MemoryRemote::new());
    let endpoint = spawn_harness(remote.clone()).await;
    let laptop = client("http-laptop", &endpoint, StrategyKind::AcceptRemote);
    let phone = client("http-phone", &endpoint, StrategyKind::AcceptLocal);

    laptop.set("note", json!("from laptop")).unwrap();
    laptop.sync().await.unwrap();

    // Same version on both sides: the phone's local value is forced past it
    phone.set("note", json!("from phone")).unwrap();
    let report = phone.sync().await.unwrap();
    assert_eq!(report.pushed, vec!["note"]);
    assert_eq!(remote.get("note").unwrap().version, 2);
    assert_eq!(phone.version("note"), 2);

    // The laptop picks it up on its next local write
    laptop.set("note", json!("laptop again")).unwrap();
    laptop.sync().await.unwrap();
    assert_eq!(*laptop.get("note").unwrap(), json!("from phone"));
    assert_eq!(remote.get("note").unwrap().value, json!("from phone"));
}

#[tokio::test]
async fn test_stale_push_is_rejected_with_conflict_status() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("k", 3, 0, json!("v3"));
    let endpoint = spawn_harness(remote.clone()).await;
    let http = HttpRemote::new(endpoint.as_str()).unwrap();

    let request = PushRequest { key: "k".to_string(), value: json!("old"), version: 2, timestamp: 1 };
    let err = http.push(&request).await.unwrap_err();
    assert!(matches!(err, SyncError::Status { status: 409, .. }));
    assert!(!err.is_retryable());

    let versions = http.fetch_versions(&["k".to_string(), "missing".to_string()]).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions["k"].version, 3);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_transport_error() {
    // Bind then drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = client("http-unreachable", &format!("http://{}", addr), StrategyKind::LastWriteWins);
    store.set("x", json!(1)).unwrap();
    let report = store.sync().await.unwrap();

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].error.is_retryable());
    assert_eq!(store.key_state("x"), KeyState::Pending);
}
