/*
    coordinator.rs - Write-behind persistence and hydration

    Committed writes mark their key dirty; a debounce timer (cancelled and
    re-armed on every mark) later flushes the dirty set in one pass. The
    flush reads each key's value as it is at flush time, so bursts of writes
    cost one storage write per key. A key that no longer exists at flush
    time is removed from storage.

    Hydration reads every record under `<namespace>:`, drops expired ones,
    decodes the rest and, when the oldest schema on disk is behind the
    configured one, runs the migration over the whole recovered set before
    anything is committed. One bad record never stops the others.
*/

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::adapter::StorageAdapter;
use super::record::StorageRecord;
use super::transform::{TransformKind, ValueTransform};
use crate::store::errors::{ErrorContext, StoreError, StoreResult};
use crate::store::snapshot::now_millis;
use crate::store::versioned::Entry;

/// `(data, from_schema, to_schema)`; rewrites the recovered key set in place
pub type MigrateFn =
    Arc<dyn Fn(&mut BTreeMap<String, Value>, u32, u32) -> anyhow::Result<()> + Send + Sync>;

/// One decoded record ready to be committed
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecord {
    pub value: Value,
    pub version: u64,
    pub timestamp: u64,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Loaded {
    pub records: BTreeMap<String, LoadedRecord>,
    pub expired: Vec<String>,
    pub errors: Vec<(ErrorContext, StoreError)>,
    /// Schema the data was migrated from
    pub migrated_from: Option<u32>,
    /// Keys the migration removed from the data set
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub loaded: usize,
    pub expired: usize,
    pub failed: usize,
    pub migrated_from: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

pub struct PersistenceCoordinator {
    adapter: Arc<dyn StorageAdapter>,
    transform: Option<Arc<dyn ValueTransform>>,
    namespace: String,
    prefix: String,
    debounce: Duration,
    schema_version: u32,
    migrate: Option<MigrateFn>,
    dirty: Mutex<BTreeSet<String>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceCoordinator {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        transform: Option<Arc<dyn ValueTransform>>,
        namespace: &str,
        debounce: Duration,
        schema_version: u32,
        migrate: Option<MigrateFn>,
    ) -> Self {
        PersistenceCoordinator {
            adapter,
            transform,
            namespace: namespace.to_string(),
            prefix: format!("{}:", namespace),
            debounce,
            schema_version,
            migrate,
            dirty: Mutex::new(BTreeSet::new()),
            timer: Mutex::new(None),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn mark_dirty(&self, key: &str) {
        self.dirty.lock().insert(key.to_string());
    }

    pub fn dirty_keys(&self) -> Vec<String> {
        self.dirty.lock().iter().cloned().collect()
    }

    /// Replace the pending flush timer
    pub fn arm(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    pub fn encode(&self, entry: &Entry) -> StoreResult<String> {
        let (d, encrypted, base64) = match &self.transform {
            Some(transform) => {
                let payload = Value::String(transform.encode(&entry.value)?);
                match transform.kind() {
                    TransformKind::Encrypted => (payload, true, false),
                    TransformKind::Base64 => (payload, false, true),
                }
            }
            None => (Value::clone(&entry.value), false, false),
        };
        let record = StorageRecord {
            v: entry.version,
            t: entry.updated_at,
            e: entry.expires_at,
            d,
            schema_version: self.schema_version,
            encrypted,
            base64,
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub fn decode(&self, raw: &str) -> StoreResult<(StorageRecord, Value)> {
        let record: StorageRecord = serde_json::from_str(raw)?;
        let value = if record.is_transformed() {
            let transform = self.transform.as_ref().ok_or_else(|| {
                StoreError::Decryption("record is transformed but no transform is configured".into())
            })?;
            let expected = if record.encrypted { TransformKind::Encrypted } else { TransformKind::Base64 };
            if transform.kind() != expected {
                return Err(StoreError::Decryption(format!(
                    "record needs a {:?} transform, configured one is {:?}",
                    expected,
                    transform.kind()
                )));
            }
            let payload = record.d.as_str().ok_or_else(|| {
                StoreError::Deserialization("transformed payload is not a string".into())
            })?;
            transform.decode(payload)?
        } else {
            record.d.clone()
        };
        Ok((record, value))
    }

    /// Write every dirty key. `current` yields the live entry of a key.
    pub fn flush(&self, current: impl Fn(&str) -> Option<Entry>) -> (FlushReport, Vec<(ErrorContext, StoreError)>) {
        let keys: Vec<String> = std::mem::take(&mut *self.dirty.lock()).into_iter().collect();
        let mut report = FlushReport::default();
        let mut errors = Vec::new();

        for key in keys {
            let storage_key = self.storage_key(&key);
            let result = match current(&key) {
                Some(entry) => self
                    .encode(&entry)
                    .and_then(|raw| self.adapter.set_item(&storage_key, &raw))
                    .map(|_| report.written.push(key.clone())),
                None => self
                    .adapter
                    .remove_item(&storage_key)
                    .map(|_| report.removed.push(key.clone())),
            };
            if let Err(err) = result {
                // Retried by the next flush
                self.mark_dirty(&key);
                report.failed.push(key.clone());
                errors.push((ErrorContext::for_key("persist", key), err));
            }
        }

        tracing::debug!(
            namespace = %self.namespace,
            written = report.written.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "flushed dirty keys"
        );
        (report, errors)
    }

    /// Read, decode and migrate every record of this namespace
    pub fn load(&self) -> Loaded {
        let now = now_millis();
        let mut loaded = Loaded::default();

        let keys = match self.adapter.keys() {
            Ok(keys) => keys,
            Err(err) => {
                loaded.errors.push((ErrorContext::new("hydration"), err));
                return loaded;
            }
        };

        let mut max_schema: Option<u32> = None;
        for storage_key in keys {
            let Some(key) = storage_key.strip_prefix(&self.prefix) else {
                continue;
            };
            let raw = match self.adapter.get_item(&storage_key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    loaded.errors.push((ErrorContext::for_key("hydration", key), err));
                    continue;
                }
            };
            let (record, value) = match self.decode(&raw) {
                Ok(decoded) => decoded,
                Err(err) => {
                    loaded.errors.push((ErrorContext::for_key("hydration", key), err));
                    continue;
                }
            };
            if record.is_expired(now) {
                if let Err(err) = self.adapter.remove_item(&storage_key) {
                    loaded.errors.push((ErrorContext::for_key("hydration", key), err));
                }
                loaded.expired.push(key.to_string());
                continue;
            }
            max_schema = Some(max_schema.map_or(record.schema_version, |m| m.max(record.schema_version)));
            loaded.records.insert(
                key.to_string(),
                LoadedRecord { value, version: record.v, timestamp: record.t, expires_at: record.e },
            );
        }

        if let (Some(stored), Some(migrate)) = (max_schema, &self.migrate) {
            if stored < self.schema_version {
                self.run_migration(&mut loaded, stored, migrate, now);
            }
        }

        loaded
    }

    fn run_migration(&self, loaded: &mut Loaded, from: u32, migrate: &MigrateFn, now: u64) {
        let to = self.schema_version;
        let mut data: BTreeMap<String, Value> =
            loaded.records.iter().map(|(key, record)| (key.clone(), record.value.clone())).collect();

        if let Err(err) = migrate(&mut data, from, to) {
            tracing::error!(namespace = %self.namespace, from, to, error = %err, "migration failed");
            // Nothing is committed from an unmigrated data set
            loaded.records.clear();
            loaded.errors.push((
                ErrorContext::new("migration"),
                StoreError::Migration { from, to, message: format!("{:#}", err) },
            ));
            return;
        }

        let previous = std::mem::take(&mut loaded.records);
        loaded.dropped = previous.keys().filter(|key| !data.contains_key(*key)).cloned().collect();
        loaded.records = data
            .into_iter()
            .map(|(key, value)| {
                let record = match previous.get(&key) {
                    Some(old) => LoadedRecord { value, ..old.clone() },
                    None => LoadedRecord { value, version: 1, timestamp: now, expires_at: None },
                };
                (key, record)
            })
            .collect();
        loaded.migrated_from = Some(from);
        tracing::info!(namespace = %self.namespace, from, to, keys = loaded.records.len(), "migrated stored data");
    }
}
