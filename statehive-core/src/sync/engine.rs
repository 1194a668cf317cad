/*
    engine.rs - Offline-first sync engine

    Local writes to tracked keys are queued as `PendingChange`s and a
    debounce timer schedules a cycle. A cycle fetches the remote's version
    of every pending key, then per key either pushes (remote unknown or
    behind) or resolves a conflict (remote at or past the local version)
    with the configured strategy.

    Only one cycle runs at a time; a second `sync()` fails immediately with
    `AlreadySyncing`. Errors stay per key: the key goes back to `Pending`
    and is retried by the next cycle.
*/

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::conflict::{ConflictInfo, ConflictStrategy, Resolution};
use super::error::{SyncError, SyncResult};
use super::queue::{KeyState, PendingChange, SyncQueue};
use super::remote::{PushAck, PushRequest, RemoteVersion, SyncRemote};
use crate::config::{ConfigError, SyncConfig};
use crate::metrics;
use crate::store::errors::{ErrorContext, StoreError, StoreResult};
use crate::store::snapshot::now_millis;
use crate::store::Store;

/// A key that could not be reconciled this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct KeySyncError {
    pub key: String,
    pub error: SyncError,
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Keys whose local value is now on the remote
    pub pushed: Vec<String>,
    pub conflicts: Vec<(ConflictInfo, Resolution)>,
    pub errors: Vec<KeySyncError>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub type SyncCallback = Arc<dyn Fn(&SyncReport) + Send + Sync>;

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    remote: Arc<dyn SyncRemote>,
    strategy: ConflictStrategy,
    /// `None` tracks every key
    filter: Option<Vec<Regex>>,
    debounce: Duration,
    interval: Option<Duration>,
    max_retries: u32,
    retry_delay: Duration,
    queue: Mutex<SyncQueue>,
    known: Mutex<HashMap<String, RemoteVersion>>,
    online: AtomicBool,
    syncing: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    on_complete: Option<SyncCallback>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn SyncRemote>,
        strategy: ConflictStrategy,
        config: &SyncConfig,
        on_complete: Option<SyncCallback>,
    ) -> StoreResult<Self> {
        let filter = match &config.keys {
            Some(patterns) => Some(
                patterns
                    .iter()
                    .map(|p| {
                        Regex::new(p).map_err(|e| {
                            ConfigError::Rejected(format!("Invalid sync key pattern: {}", e))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        Ok(SyncEngine {
            remote,
            strategy,
            filter,
            debounce: config.debounce,
            interval: config.interval,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            queue: Mutex::new(SyncQueue::new()),
            known: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            syncing: AtomicBool::new(false),
            timer: Mutex::new(None),
            periodic: Mutex::new(None),
            on_complete,
        })
    }

    pub fn tracks(&self, key: &str) -> bool {
        match &self.filter {
            Some(patterns) => patterns.iter().any(|re| re.is_match(key)),
            None => true,
        }
    }

    pub fn strategy(&self) -> &ConflictStrategy {
        &self.strategy
    }

    pub fn queue_change(&self, change: PendingChange) {
        debug!(key = %change.key, version = change.local_version, "queued change for sync");
        self.queue.lock().queue(change);
    }

    pub fn forget(&self, key: &str) {
        self.queue.lock().forget(key);
    }

    pub fn pending(&self) -> Vec<PendingChange> {
        self.queue.lock().pending()
    }

    pub fn key_state(&self, key: &str) -> KeyState {
        self.queue.lock().state(key)
    }

    /// Last version seen on the remote for `key`
    pub fn remote_version(&self, key: &str) -> Option<RemoteVersion> {
        self.known.lock().get(key).cloned()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_online(&self, store: &Store, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("back online, scheduling sync");
            if !self.queue.lock().is_empty() {
                self.trigger(store, Duration::ZERO);
            }
        } else if !online && was_online {
            info!("offline, local changes will queue");
            self.cancel_timer();
        }
    }

    /// Re-arm the debounce timer
    pub(crate) fn schedule(&self, store: &Store) {
        self.trigger(store, self.debounce);
    }

    fn trigger(&self, store: &Store, delay: Duration) {
        // Without a runtime only explicit `sync()` calls run cycles
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let weak = store.downgrade();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(store) = weak.upgrade() {
                // Detached so re-arming the timer never aborts a running cycle
                tokio::spawn(run_scheduled(store));
            }
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn start_periodic(&self, store: &Store) {
        let Some(period) = self.interval else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, periodic sync disabled");
            return;
        };
        let weak = store.downgrade();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = store.sync().await {
                    debug!(error = %err, "periodic sync skipped");
                }
            }
        });
        if let Some(previous) = self.periodic.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    pub(crate) fn shutdown(&self) {
        self.cancel_timer();
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
    }

    pub(crate) async fn run_cycle(&self, store: &Store) -> SyncResult<SyncReport> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        if self.syncing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(SyncError::AlreadySyncing);
        }
        let _cycle = CycleGuard(&self.syncing);
        self.cancel_timer();

        let changes = self.queue.lock().begin_cycle();
        let mut report = SyncReport::default();

        if !changes.is_empty() {
            let keys: Vec<String> = changes.iter().map(|c| c.key.clone()).collect();
            debug!(keys = keys.len(), "sync cycle started");

            match self.remote.fetch_versions(&keys).await {
                Ok(versions) => {
                    self.known.lock().extend(versions.iter().map(|(k, v)| (k.clone(), v.clone())));
                    for change in changes {
                        let remote = versions.get(&change.key).cloned();
                        self.reconcile(store, change, remote, &mut report).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "fetching remote versions failed");
                    let mut queue = self.queue.lock();
                    for change in changes {
                        queue.retry_later(&change.key);
                        report.errors.push(KeySyncError { key: change.key, error: err.clone() });
                    }
                }
            }
        }

        for failure in &report.errors {
            store.reporter().report(
                &StoreError::Sync(failure.error.clone()),
                &ErrorContext::for_key("sync", failure.key.clone()),
            );
        }
        metrics::record_counter(metrics::SYNC_PUSHED, report.pushed.len() as u64);
        metrics::record_counter(metrics::SYNC_CONFLICTS, report.conflicts.len() as u64);
        info!(
            pushed = report.pushed.len(),
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            "sync cycle finished"
        );

        if let Some(callback) = &self.on_complete {
            callback(&report);
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        store: &Store,
        change: PendingChange,
        remote: Option<RemoteVersion>,
        report: &mut SyncReport,
    ) {
        let remote = match remote {
            Some(remote) if remote.version >= change.local_version => remote,
            _ => {
                let request = PushRequest {
                    key: change.key.clone(),
                    value: change.value().clone(),
                    version: change.local_version,
                    timestamp: change.local_timestamp,
                };
                self.push_change(store, &change, request, report).await;
                return;
            }
        };

        // A write that landed during the fetch owns the key now; the next
        // cycle resolves it against the remote.
        if !self.queue.lock().is_current(&change.key, change.local_version) {
            debug!(key = %change.key, "change superseded during cycle, deferring conflict");
            self.queue.lock().retry_later(&change.key);
            return;
        }

        let info = ConflictInfo {
            key: change.key.clone(),
            local_value: change.value().clone(),
            remote_value: remote.value.clone(),
            local_version: change.local_version,
            remote_version: remote.version,
            local_timestamp: change.local_timestamp,
            remote_timestamp: remote.timestamp,
        };
        let resolution = self.strategy.resolve(&info);
        info!(
            key = %info.key,
            local_version = info.local_version,
            remote_version = info.remote_version,
            ?resolution,
            "sync conflict"
        );

        match &resolution {
            Resolution::KeepLocal => {
                let request = PushRequest {
                    key: change.key.clone(),
                    value: change.value().clone(),
                    version: remote.version + 1,
                    timestamp: now_millis(),
                };
                self.push_change(store, &change, request, report).await;
            }
            Resolution::TakeRemote => match store.apply_remote(&change.key, remote.value.clone()) {
                Ok(_) => {
                    store.align_version(&change.key, remote.version);
                    self.queue.lock().settle(&change.key, change.local_version);
                }
                Err(err) => self.local_write_failed(&change.key, err, report),
            },
            Resolution::Merged(merged) => match store.apply_remote(&change.key, merged.clone()) {
                Ok(_) => {
                    let request = PushRequest {
                        key: change.key.clone(),
                        value: merged.clone(),
                        version: change.local_version.max(remote.version) + 1,
                        timestamp: now_millis(),
                    };
                    self.push_change(store, &change, request, report).await;
                }
                Err(err) => self.local_write_failed(&change.key, err, report),
            },
            Resolution::Discarded => {
                self.queue.lock().discard(&change.key, change.local_version);
            }
        }

        report.conflicts.push((info, resolution));
    }

    async fn push_change(
        &self,
        store: &Store,
        change: &PendingChange,
        request: PushRequest,
        report: &mut SyncReport,
    ) {
        match self.push_with_retry(&request).await {
            Ok(ack) => {
                store.align_version(&change.key, ack.version);
                self.known.lock().insert(
                    change.key.clone(),
                    RemoteVersion { version: ack.version, timestamp: ack.timestamp, value: request.value },
                );
                self.queue.lock().complete(&change.key, change.local_version);
                report.pushed.push(change.key.clone());
            }
            Err(error) => {
                warn!(key = %change.key, error = %error, "push failed, keeping change pending");
                self.queue.lock().retry_later(&change.key);
                report.errors.push(KeySyncError { key: change.key.clone(), error });
            }
        }
    }

    async fn push_with_retry(&self, request: &PushRequest) -> SyncResult<PushAck> {
        let attempts = self.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.remote.push(request).await {
                Ok(ack) => return Ok(ack),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(key = %request.key, attempt, error = %err, "push failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(SyncError::RetriesExhausted {
                        key: request.key.clone(),
                        attempts,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn local_write_failed(&self, key: &str, err: StoreError, report: &mut SyncReport) {
        self.queue.lock().retry_later(key);
        report.errors.push(KeySyncError {
            key: key.to_string(),
            error: SyncError::LocalWrite { key: key.to_string(), message: err.to_string() },
        });
    }
}

async fn run_scheduled(store: Store) {
    match store.sync().await {
        Ok(_) => {}
        Err(SyncError::AlreadySyncing) => store.schedule_sync(),
        Err(err) => debug!(error = %err, "scheduled sync skipped"),
    }
}
