//! Pending-change queue and per-key sync state
//!
//! A key moves `Clean|Conflicted -> Pending` when written locally,
//! `Pending -> Syncing` when a cycle picks it up, and back to `Clean` (or
//! `Conflicted` when a conflict was discarded) once reconciled. A failed
//! attempt returns it to `Pending`. A write landing while its key is
//! syncing replaces the snapshot; the in-flight result then leaves the
//! newer change queued.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::store::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Clean,
    Pending,
    Syncing,
    Conflicted,
}

/// A local write waiting to be reconciled
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub key: String,
    /// Snapshot taken at write time; later writes do not touch it
    pub value: Snapshot,
    pub local_timestamp: u64,
    pub local_version: u64,
}

impl PendingChange {
    pub fn value(&self) -> &Value {
        &self.value
    }
}

#[derive(Debug, Default)]
pub struct SyncQueue {
    pending: BTreeMap<String, PendingChange>,
    states: HashMap<String, KeyState>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, change: PendingChange) {
        self.states.insert(change.key.clone(), KeyState::Pending);
        self.pending.insert(change.key.clone(), change);
    }

    /// Every pending change, now marked `Syncing`
    pub fn begin_cycle(&mut self) -> Vec<PendingChange> {
        for key in self.pending.keys() {
            self.states.insert(key.clone(), KeyState::Syncing);
        }
        self.pending.values().cloned().collect()
    }

    /// Whether `local_version` is still the queued change for `key`
    pub fn is_current(&self, key: &str, local_version: u64) -> bool {
        self.pending.get(key).map(|change| change.local_version == local_version).unwrap_or(false)
    }

    /// Reconciled. Returns false when a newer change took its place.
    pub fn complete(&mut self, key: &str, local_version: u64) -> bool {
        self.finish(key, local_version, KeyState::Clean)
    }

    /// Drop the change and leave the key unsynced
    pub fn discard(&mut self, key: &str, local_version: u64) -> bool {
        self.finish(key, local_version, KeyState::Conflicted)
    }

    /// Drop the change, the key now matches the remote
    pub fn settle(&mut self, key: &str, local_version: u64) -> bool {
        self.finish(key, local_version, KeyState::Clean)
    }

    fn finish(&mut self, key: &str, local_version: u64, state: KeyState) -> bool {
        match self.pending.get(key) {
            Some(change) if change.local_version == local_version => {
                self.pending.remove(key);
                self.states.insert(key.to_string(), state);
                true
            }
            Some(_) => {
                self.states.insert(key.to_string(), KeyState::Pending);
                false
            }
            None => false,
        }
    }

    /// Failed attempt; retried next cycle
    pub fn retry_later(&mut self, key: &str) {
        if self.pending.contains_key(key) {
            self.states.insert(key.to_string(), KeyState::Pending);
        }
    }

    /// Key was removed locally
    pub fn forget(&mut self, key: &str) {
        self.pending.remove(key);
        self.states.remove(key);
    }

    pub fn state(&self, key: &str) -> KeyState {
        self.states.get(key).copied().unwrap_or(KeyState::Clean)
    }

    pub fn get(&self, key: &str) -> Option<&PendingChange> {
        self.pending.get(key)
    }

    pub fn pending(&self) -> Vec<PendingChange> {
        self.pending.values().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.states.clear();
    }
}
