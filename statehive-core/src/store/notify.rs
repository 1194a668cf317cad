/*
    notify.rs - Subscribers and transaction batching

    Three kinds of subscribers:
    - global listeners get every change, coalesced per transaction
    - key listeners get the changes of one key as they happen
    - watchers get (new, old) pairs for one key as they happen

    Listener panics are caught per call so one bad subscriber never stops
    the delivery pass for the others.
*/

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use super::errors::{ErrorContext, ErrorReporter, StoreError};
use super::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Removed,
    /// A computed key produced a new value
    Computed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: String,
    /// `None` after a removal
    pub value: Option<Snapshot>,
    /// Entry version after the change (0 for removals and computed keys)
    pub version: u64,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: String,
    pub new: Option<Snapshot>,
    pub old: Option<Snapshot>,
}

pub type Listener = Arc<dyn Fn(&[ChangeEvent]) + Send + Sync>;
pub type Watcher = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Subscribers {
    next_id: u64,
    global: BTreeMap<SubscriptionId, Listener>,
    keyed: HashMap<String, BTreeMap<SubscriptionId, Listener>>,
    watchers: HashMap<String, BTreeMap<SubscriptionId, Watcher>>,
}

impl Subscribers {
    fn next(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub fn add_global(&mut self, listener: Listener) -> SubscriptionId {
        let id = self.next();
        self.global.insert(id, listener);
        id
    }

    pub fn add_keyed(&mut self, key: &str, listener: Listener) -> SubscriptionId {
        let id = self.next();
        self.keyed.entry(key.to_string()).or_default().insert(id, listener);
        id
    }

    pub fn add_watcher(&mut self, key: &str, watcher: Watcher) -> SubscriptionId {
        let id = self.next();
        self.watchers.entry(key.to_string()).or_default().insert(id, watcher);
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        if self.global.remove(&id).is_some() {
            return true;
        }
        for map in self.keyed.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        for map in self.watchers.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        false
    }

    pub fn global(&self) -> Vec<Listener> {
        self.global.values().cloned().collect()
    }

    pub fn keyed(&self, key: &str) -> Vec<Listener> {
        self.keyed.get(key).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    pub fn watchers(&self, key: &str) -> Vec<Watcher> {
        self.watchers.get(key).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.global.len()
            + self.keyed.values().map(BTreeMap::len).sum::<usize>()
            + self.watchers.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.global.clear();
        self.keyed.clear();
        self.watchers.clear();
    }
}

/// Handle returned by `subscribe`; call `unsubscribe` to stop delivery
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, registry: &Arc<Mutex<Subscribers>>) -> Self {
        Subscription { id, registry: Arc::downgrade(registry) }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns `false` if it was already removed or the store is gone
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().remove(self.id),
            None => false,
        }
    }
}

/// Transaction state: nesting depth plus the changes awaiting the global pass
#[derive(Debug, Default)]
pub struct Batch {
    depth: usize,
    pending: Vec<ChangeEvent>,
}

impl Batch {
    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Enter a transaction; `true` for the outermost one
    pub fn begin(&mut self) -> bool {
        self.depth += 1;
        self.depth == 1
    }

    /// Leave a transaction; the outermost exit hands back the coalesced changes
    pub fn end(&mut self) -> Option<Vec<ChangeEvent>> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.pending.push(event);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn deliver(
    listeners: &[Listener],
    events: &[ChangeEvent],
    reporter: &ErrorReporter,
    key: Option<&str>,
) {
    for listener in listeners {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(events))) {
            reporter.report(
                &StoreError::Subscriber(panic_message(payload)),
                &ErrorContext { operation: "listener".to_string(), key: key.map(str::to_string) },
            );
        }
    }
}

pub(crate) fn deliver_watch(watchers: &[Watcher], event: &WatchEvent, reporter: &ErrorReporter) {
    for watcher in watchers {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| watcher(event))) {
            reporter.report(
                &StoreError::Subscriber(panic_message(payload)),
                &ErrorContext::for_key("watcher", event.key.clone()),
            );
        }
    }
}
