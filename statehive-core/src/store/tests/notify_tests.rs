/*
    notify_tests.rs - Transactions, subscriber kinds and listener isolation
*/

use super::ErrorLog;
use crate::config::Config;
use crate::store::{ChangeEvent, ChangeKind, Store};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Batches = Arc<Mutex<Vec<Vec<String>>>>;

fn record_batches(store: &Store) -> Batches {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    store.subscribe(move |events: &[ChangeEvent]| {
        sink.lock().push(events.iter().map(|e| e.key.clone()).collect());
    });
    batches
}

#[test]
fn test_global_listener_outside_transaction() {
    let store = Store::in_memory("notify-plain").unwrap();
    let batches = record_batches(&store);

    store.set("a", json!(1)).unwrap();
    store.set("b", json!(2)).unwrap();
    assert_eq!(*batches.lock(), vec![vec!["a"], vec!["b"]]);
}

#[test]
fn test_transaction_coalesces_global_notifications() {
    let store = Store::in_memory("notify-tx").unwrap();
    let batches = record_batches(&store);

    let keyed = Arc::new(AtomicUsize::new(0));
    let counter = keyed.clone();
    store.subscribe_key("count", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let observed_inside = store.transaction(|s| {
        for n in 1..=10 {
            s.set("count", json!(n)).unwrap();
        }
        s.set("done", json!(true)).unwrap();
        assert!(s.in_transaction());
        keyed.load(Ordering::SeqCst)
    });

    // Key listeners are not batched
    assert_eq!(observed_inside, 10);
    assert!(!store.in_transaction());

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 11);
    assert_eq!(batches[0].last().map(String::as_str), Some("done"));
}

#[test]
fn test_nested_transactions_flush_at_the_outermost_exit() {
    let store = Store::in_memory("notify-nested").unwrap();
    let batches = record_batches(&store);

    store.transaction(|outer| {
        outer.set("a", json!(1)).unwrap();
        outer.transaction(|inner| {
            inner.set("b", json!(2)).unwrap();
        });
        assert!(batches.lock().is_empty());
        outer.set("c", json!(3)).unwrap();
    });

    assert_eq!(*batches.lock(), vec![vec!["a", "b", "c"]]);
}

#[test]
fn test_noop_writes_inside_transaction_are_not_delivered() {
    let store = Store::in_memory("notify-noop").unwrap();
    store.set("same", json!({"v": 1})).unwrap();
    let batches = record_batches(&store);

    store.transaction(|s| {
        assert!(!s.set("same", json!({"v": 1})).unwrap());
        assert!(!s.update("same", |_| None).unwrap());
    });
    assert!(batches.lock().is_empty());

    store.transaction(|s| {
        s.set("same", json!({"v": 1})).unwrap();
        s.set("other", json!(0)).unwrap();
    });
    assert_eq!(*batches.lock(), vec![vec!["other"]]);
}

#[test]
fn test_watch_receives_new_and_old() {
    let store = Store::in_memory("notify-watch").unwrap();
    let pairs = Arc::new(Mutex::new(Vec::new()));
    let sink = pairs.clone();
    store.watch("theme", move |event| {
        sink.lock().push((event.new.as_deref().cloned(), event.old.as_deref().cloned()));
    });

    store.set("theme", json!("light")).unwrap();
    store.set("theme", json!("dark")).unwrap();
    store.set("theme", json!("dark")).unwrap();
    store.remove("theme");

    assert_eq!(
        *pairs.lock(),
        vec![
            (Some(json!("light")), None),
            (Some(json!("dark")), Some(json!("light"))),
            (None, Some(json!("dark"))),
        ]
    );
}

#[test]
fn test_change_events_carry_versions() {
    let store = Store::in_memory("notify-versions").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    store.subscribe_key("k", move |batch| sink.lock().extend(batch.iter().map(|e| (e.version, e.kind))));

    store.set("k", json!(1)).unwrap();
    store.set("k", json!(2)).unwrap();
    store.remove("k");

    assert_eq!(*events.lock(), vec![(1, ChangeKind::Set), (2, ChangeKind::Set), (2, ChangeKind::Removed)]);
}

#[test]
fn test_panicking_listener_does_not_stop_delivery() {
    let errors = ErrorLog::new();
    let store = Store::builder(Config::with_namespace("notify-panic")).on_error(errors.handler()).build().unwrap();

    store.subscribe(|_| panic!("listener exploded"));
    let batches = record_batches(&store);
    let watched = Arc::new(AtomicUsize::new(0));
    store.watch("x", |_| panic!("watcher exploded"));
    let counter = watched.clone();
    store.watch("x", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(store.set("x", json!(1)).unwrap());
    assert_eq!(*store.get("x").unwrap(), json!(1));
    assert_eq!(batches.lock().len(), 1);
    assert_eq!(watched.load(Ordering::SeqCst), 1);

    let mut operations = errors.operations();
    operations.sort();
    assert_eq!(operations, vec!["listener", "watcher"]);
    assert!(errors.messages().iter().any(|m| m.contains("listener exploded")));
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let store = Store::in_memory("notify-unsub").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let subscription = store.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store.set("a", json!(1)).unwrap();
    assert!(subscription.unsubscribe());
    store.set("a", json!(2)).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!subscription.unsubscribe());
}

#[test]
fn test_listener_can_write_back_into_the_store() {
    let store = Store::in_memory("notify-reentrant").unwrap();
    let handle = store.clone();
    store.subscribe_key("celsius", move |events| {
        if let Some(c) = events[0].value.as_ref().and_then(|v| v.as_f64()) {
            handle.set("fahrenheit", json!(c * 9.0 / 5.0 + 32.0)).unwrap();
        }
    });

    store.set("celsius", json!(100.0)).unwrap();
    assert_eq!(*store.get("fahrenheit").unwrap(), json!(212.0));
}
