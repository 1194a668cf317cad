/*
    versioned.rs - Key -> value mapping with per-key versions

    The map owns the committed snapshots. Versions start at 1 on the first
    commit of a key and increase by one per committed change. Removing a key
    destroys its entry, so a re-created key starts over at 1.

    Expired entries stay in the map until purged but are invisible to reads.
*/

use std::collections::{BTreeMap, HashMap};

use super::snapshot::{estimate_size, Snapshot};

/// One committed key
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Snapshot,
    pub version: u64,
    /// Rough byte footprint (see `snapshot::estimate_size`)
    pub size: usize,
    /// Epoch millis of the last commit
    pub updated_at: u64,
    /// Epoch millis after which the entry reads as absent
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct VersionedMap {
    entries: HashMap<String, Entry>,
    total_size: usize,
}

impl VersionedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `key`
    pub fn get(&self, key: &str, now: u64) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    pub fn contains(&self, key: &str, now: u64) -> bool {
        self.get(key, now).is_some()
    }

    /// Version of the live entry, 0 when absent
    pub fn version(&self, key: &str, now: u64) -> u64 {
        self.get(key, now).map(|entry| entry.version).unwrap_or(0)
    }

    /// Commit a new value, bumping the version. Returns the new version.
    /// An expired entry counts as absent, so its key starts over at 1.
    pub fn commit(&mut self, key: &str, value: Snapshot, now: u64, expires_at: Option<u64>) -> u64 {
        let version = self.get(key, now).map(|e| e.version + 1).unwrap_or(1);
        self.insert(key, Entry { size: estimate_size(&value), value, version, updated_at: now, expires_at });
        version
    }

    /// Insert an entry with an explicit version, e.g. during hydration
    pub fn restore(
        &mut self,
        key: &str,
        value: Snapshot,
        version: u64,
        updated_at: u64,
        expires_at: Option<u64>,
    ) {
        self.insert(
            key,
            Entry { size: estimate_size(&value), value, version: version.max(1), updated_at, expires_at },
        );
    }

    /// Raise the version of an existing entry to at least `version`
    pub fn align_version(&mut self, key: &str, version: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.version < version => {
                entry.version = version;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let removed = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(removed.size);
        Some(removed)
    }

    /// Size the store would have after replacing `key` with a value of `size`
    pub fn projected_size(&self, key: &str, size: usize) -> usize {
        let current = self.entries.get(key).map(|e| e.size).unwrap_or(0);
        self.total_size - current + size
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted copy of every live value
    pub fn snapshot(&self, now: u64) -> BTreeMap<String, Snapshot> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    pub fn expired_keys(&self, now: u64) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn insert(&mut self, key: &str, entry: Entry) {
        self.total_size += entry.size;
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            self.total_size = self.total_size.saturating_sub(previous.size);
        }
    }
}
