/*
    store_tests.rs - Versioned store behaviour
*/

use super::ErrorLog;
use crate::config::{Config, LimitPolicy};
use crate::store::{ChangeKind, SetOptions, Store};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn store_with_errors(config: Config) -> (Store, ErrorLog) {
    let errors = ErrorLog::new();
    let store = Store::builder(config).on_error(errors.handler()).build().unwrap();
    (store, errors)
}

#[test]
fn test_equal_write_commits_once() {
    let store = Store::in_memory("idempotence").unwrap();
    let notifications = Arc::new(Mutex::new(0usize));
    let counter = notifications.clone();
    store.subscribe(move |_| *counter.lock() += 1);

    assert!(store.set("theme", json!({"mode": "dark", "size": 12})).unwrap());
    assert!(!store.set("theme", json!({"mode": "dark", "size": 12})).unwrap());

    assert_eq!(store.version("theme"), 1);
    assert_eq!(*notifications.lock(), 1);
}

#[test]
fn test_versions_increment_per_change() {
    let store = Store::in_memory("versions").unwrap();
    for n in 0..5 {
        store.set("counter", json!(n)).unwrap();
    }
    assert_eq!(store.version("counter"), 5);
    assert_eq!(store.version("missing"), 0);

    let info = store.entry("counter").unwrap();
    assert_eq!(info.version, 5);
    assert_eq!(info.size, 8);
}

#[test]
fn test_update_mutates_draft() {
    let store = Store::in_memory("drafts").unwrap();
    store.set("user", json!({"name": "ada", "tags": []})).unwrap();

    let committed = store
        .update("user", |draft| {
            draft["name"] = json!("grace");
            if let Some(tags) = draft["tags"].as_array_mut() {
                tags.push(json!("admin"));
            }
            None
        })
        .unwrap();
    assert!(committed);
    assert_eq!(*store.get("user").unwrap(), json!({"name": "grace", "tags": ["admin"]}));

    // A replacement wins over the draft
    store.update("user", |_| Some(json!("replaced"))).unwrap();
    assert_eq!(*store.get("user").unwrap(), json!("replaced"));
}

#[test]
fn test_update_of_missing_key_starts_from_null() {
    let store = Store::in_memory("drafts-null").unwrap();
    store
        .update("count", |draft| {
            assert!(draft.is_null());
            Some(json!(1))
        })
        .unwrap();
    assert_eq!(*store.get("count").unwrap(), json!(1));

    // Draft left untouched is a no-op
    assert!(!store.update("count", |_| None).unwrap());
    assert_eq!(store.version("count"), 1);
}

#[test]
fn test_snapshots_are_independent_of_later_writes() {
    let store = Store::in_memory("snapshots").unwrap();
    store.set("doc", json!({"rev": 1})).unwrap();
    let before = store.get("doc").unwrap();

    store.update("doc", |draft| {
        draft["rev"] = json!(2);
        None
    })
    .unwrap();

    assert_eq!(*before, json!({"rev": 1}));
    assert_eq!(*store.get("doc").unwrap(), json!({"rev": 2}));
}

#[test]
fn test_invalid_keys_are_rejected_and_reported() {
    let (store, errors) = store_with_errors(Config::with_namespace("keys"));

    assert!(!store.set("has space", json!(1)).unwrap());
    assert!(!store.set("", json!(1)).unwrap());
    assert!(!store.set(&"k".repeat(257), json!(1)).unwrap());
    assert!(store.get("has space").is_none());

    assert!(store.is_empty());
    assert_eq!(errors.operations(), vec!["validation", "validation", "validation", "validation"]);
}

#[test]
fn test_remove() {
    let store = Store::in_memory("remove").unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    store.subscribe_key("session", move |events| sink.lock().extend(events.iter().map(|e| e.kind)));

    store.set("session", json!("abc")).unwrap();
    store.set("session", json!("def")).unwrap();
    assert!(store.remove("session"));
    assert!(!store.remove("session"));
    assert!(store.get("session").is_none());

    // A re-created key starts over
    store.set("session", json!("ghi")).unwrap();
    assert_eq!(store.version("session"), 1);

    assert_eq!(
        *kinds.lock(),
        vec![ChangeKind::Set, ChangeKind::Set, ChangeKind::Removed, ChangeKind::Set]
    );
}

#[test]
fn test_list_returns_sorted_snapshot() {
    let store = Store::in_memory("list").unwrap();
    store.set("b", json!(2)).unwrap();
    store.set("a", json!(1)).unwrap();

    let listed = store.list();
    let keys: Vec<&String> = listed.keys().collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert_eq!(*listed["b"], json!(2));
}

#[test]
fn test_size_limit_warns_by_default() {
    let mut config = Config::with_namespace("limits-warn");
    config.store.max_object_size = 10;
    let (store, errors) = store_with_errors(config);

    assert!(store.set("big", json!("a long string value")).unwrap());
    assert_eq!(errors.operations(), vec!["validation"]);
    assert!(errors.messages()[0].contains("Object too large"));
}

#[test]
fn test_size_limit_rejects_when_configured() {
    let mut config = Config::with_namespace("limits-reject");
    config.store.max_total_size = 20;
    config.store.limit_policy = LimitPolicy::Reject;
    let (store, errors) = store_with_errors(config);

    assert!(store.set("a", json!("12345")).unwrap());
    assert!(!store.set("b", json!("123456")).unwrap());
    assert!(store.get("b").is_none());
    assert!(errors.messages()[0].contains("Store too large"));

    // Replacing an entry only counts the difference
    assert!(store.set("a", json!("1234567890")).unwrap());
}

#[test]
fn test_ttl_expires_entries() {
    let store = Store::in_memory("ttl").unwrap();
    store.set_with("token", json!("t"), SetOptions::new().ttl(Duration::ZERO)).unwrap();
    store.set_with("keep", json!("k"), SetOptions::new().ttl(Duration::from_secs(3600))).unwrap();

    assert!(store.get("token").is_none());
    assert!(!store.contains("token"));
    assert!(store.entry("keep").unwrap().expires_at.is_some());

    assert_eq!(store.purge_expired(), vec!["token"]);
    assert!(store.purge_expired().is_empty());
    assert_eq!(store.list().len(), 1);
}

#[test]
fn test_silent_write_commits_without_notifying() {
    let store = Store::in_memory("silent").unwrap();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    store.subscribe(move |_| *counter.lock() += 1);

    assert!(store.set_with("quiet", json!(1), SetOptions::new().silent()).unwrap());
    assert_eq!(store.version("quiet"), 1);
    assert_eq!(*calls.lock(), 0);
}

#[test]
fn test_get_as_deserializes() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Prefs {
        theme: String,
        font_size: u32,
    }

    let store = Store::in_memory("typed").unwrap();
    store.set("prefs", json!({"theme": "dark", "font_size": 14})).unwrap();

    let prefs: Prefs = store.get_as("prefs").unwrap().unwrap();
    assert_eq!(prefs, Prefs { theme: "dark".to_string(), font_size: 14 });
    assert!(store.get_as::<Prefs>("missing").unwrap().is_none());
    assert!(store.get_as::<u32>("prefs").is_err());
}

#[test]
fn test_store_handles_share_state() {
    let store = Store::in_memory("handles").unwrap();
    let other = store.clone();
    other.set("shared", Value::Bool(true)).unwrap();
    assert_eq!(*store.get("shared").unwrap(), json!(true));
    assert!(store.ptr_eq(&other));
}
