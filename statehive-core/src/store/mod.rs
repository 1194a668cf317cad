/*
    Store - the reactive, versioned key-value container

    A `Store` is a cheap handle (`Arc` inside) over one namespace. All store
    operations are synchronous; only flushing, hydration and sync cycles
    are async, and they tolerate the store changing underneath them.

    Write path of `set`:

        validate key -> access gate -> on_before_set hooks -> freeze
        -> deep-equal check -> size limits -> commit (version + 1)
        -> computed propagation -> on_set hooks -> persistence / sync queue
        -> notifications

    A write whose frozen value equals the current one stops at the
    deep-equal check: no version bump, no persistence, no notification.

    No internal lock is held while user code (selectors, hooks, listeners)
    runs, so callbacks may freely call back into the store.
*/

pub mod builder;
pub mod computed;
pub mod errors;
pub mod key;
pub mod notify;
pub mod registry;
pub mod snapshot;
pub mod versioned;

#[cfg(test)]
mod tests;

pub use builder::StoreBuilder;
pub use computed::{Selector, Tracker, ValueSource};
pub use errors::{ErrorContext, ErrorHandler, ErrorReporter, StoreError, StoreResult};
pub use notify::{ChangeEvent, ChangeKind, Listener, Subscription, SubscriptionId, WatchEvent, Watcher};
pub use snapshot::Snapshot;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::config::{Config, LimitPolicy};
use crate::hooks::{
    self, AccessGate, AccessRule, AuditEntry, AuditLog, Decision, Hook, HookPipeline, Permission,
    Plugin, PluginContext, PluginMethod, TransactionPhase,
};
use crate::metrics;
use crate::persist::{FlushReport, HydrationReport, PersistenceCoordinator};
use crate::sync::{KeyState, PendingChange, RemoteVersion, SyncEngine, SyncError, SyncReport, SyncResult};
use computed::ComputedGraph;
use key::is_valid_key;
use notify::{deliver, deliver_watch, Batch, Subscribers};
use snapshot::{deep_equal, estimate_size, freeze_owned, now_millis};
use versioned::{Entry, VersionedMap};

/// Per-write options of `Store::set_with` / `Store::update_with`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Persist this write; `None` uses `persistence.persist_by_default`
    pub persist: Option<bool>,
    /// Queue this write for sync; `None` syncs tracked keys
    pub sync: Option<bool>,
    /// Entry reads as absent after this long
    pub ttl: Option<Duration>,
    /// Commit without notifying subscribers
    pub silent: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Metadata of one live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub version: u64,
    pub size: usize,
    pub updated_at: u64,
    pub expires_at: Option<u64>,
}

impl From<&Entry> for EntryInfo {
    fn from(entry: &Entry) -> Self {
        EntryInfo {
            version: entry.version,
            size: entry.size,
            updated_at: entry.updated_at,
            expires_at: entry.expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// A caller of the public API
    Local,
    /// A value reconciled by the sync engine
    Remote,
}

/// A change plus the value it replaced, for watchers
type Change = (ChangeEvent, Option<Snapshot>);

struct StoreInner {
    config: Config,
    state: RwLock<VersionedMap>,
    graph: Mutex<ComputedGraph>,
    subscribers: Arc<Mutex<Subscribers>>,
    batch: Mutex<Batch>,
    hooks: RwLock<HookPipeline>,
    access: RwLock<AccessGate>,
    audit: Mutex<AuditLog>,
    user: RwLock<Option<String>>,
    reporter: ErrorReporter,
    persistence: Option<PersistenceCoordinator>,
    sync: Option<SyncEngine>,
    ready: watch::Sender<bool>,
    destroyed: AtomicBool,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning handle used by background timers
#[derive(Clone)]
pub struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

struct TransactionGuard<'a> {
    store: &'a Store,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.store.end_transaction();
    }
}

/// Handle to one installed plugin's methods
pub struct PluginHandle<'a> {
    store: &'a Store,
    name: String,
}

impl PluginHandle<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, method: &str, args: Value) -> StoreResult<Value> {
        self.store.call_plugin(&self.name, method, args)
    }
}

impl Store {
    /// Build a store from configuration alone
    pub fn new(config: Config) -> StoreResult<Self> {
        StoreBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> StoreBuilder {
        StoreBuilder::new(config)
    }

    /// Store without persistence or sync
    pub fn in_memory(namespace: &str) -> StoreResult<Self> {
        StoreBuilder::new(Config::with_namespace(namespace)).build()
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.store.namespace
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore { inner: Arc::downgrade(&self.inner) }
    }

    /// Whether both handles point at the same store
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn reporter(&self) -> &ErrorReporter {
        &self.inner.reporter
    }

    fn report(&self, err: StoreError, ctx: ErrorContext) {
        self.inner.reporter.report(&err, &ctx);
    }

    fn validate(&self, key: &str) -> bool {
        if is_valid_key(key) {
            return true;
        }
        self.report(StoreError::InvalidKey(key.to_string()), ErrorContext::for_key("validation", key));
        false
    }

    // ========================================================================
    // Reads and writes
    // ========================================================================

    /// Commit `value` under `key`. `Ok(false)` means nothing was committed.
    pub fn set(&self, key: &str, value: Value) -> StoreResult<bool> {
        self.set_with(key, value, SetOptions::default())
    }

    pub fn set_with(&self, key: &str, value: Value, options: SetOptions) -> StoreResult<bool> {
        self.write(key, |_| value, &options, Origin::Local)
    }

    /// Mutate a draft of the current value (`null` when absent). Returning
    /// `Some` replaces the draft instead.
    pub fn update(&self, key: &str, updater: impl FnOnce(&mut Value) -> Option<Value>) -> StoreResult<bool> {
        self.update_with(key, updater, SetOptions::default())
    }

    pub fn update_with(
        &self,
        key: &str,
        updater: impl FnOnce(&mut Value) -> Option<Value>,
        options: SetOptions,
    ) -> StoreResult<bool> {
        self.write(
            key,
            |current| {
                let mut draft = snapshot::draft(current);
                updater(&mut draft).unwrap_or(draft)
            },
            &options,
            Origin::Local,
        )
    }

    fn write(
        &self,
        key: &str,
        produce: impl FnOnce(Option<&Snapshot>) -> Value,
        options: &SetOptions,
        origin: Origin,
    ) -> StoreResult<bool> {
        if !self.validate(key) {
            return Ok(false);
        }
        if origin == Origin::Local && !self.authorize(key, Permission::Write) {
            return Ok(false);
        }
        if self.inner.graph.lock().contains(key) {
            self.report(
                StoreError::Computed { key: key.to_string(), message: "computed keys are read-only".to_string() },
                ErrorContext::for_key("validation", key),
            );
            return Ok(false);
        }

        let now = now_millis();
        let (previous, current_version) = {
            let state = self.inner.state.read();
            let entry = state.get(key, now);
            (entry.map(|e| e.value.clone()), entry.map(|e| e.version).unwrap_or(0))
        };

        let proposed = produce(previous.as_ref());
        let plugins = self.inner.hooks.read().plugins();
        let value = hooks::run_before_set(self, &plugins, key, proposed, current_version)?;

        if deep_equal(previous.as_deref(), Some(&value)) {
            trace!(key, "write skipped, value unchanged");
            metrics::record_counter(metrics::STORE_NOOP_WRITES, 1);
            return Ok(false);
        }

        let snapshot = freeze_owned(value);
        if !self.check_limits(key, &snapshot) {
            return Ok(false);
        }

        let expires_at = options.ttl.map(|ttl| now + ttl.as_millis() as u64);
        let (version, total_size) = {
            let mut state = self.inner.state.write();
            let version = state.commit(key, snapshot.clone(), now, expires_at);
            (version, state.total_size())
        };
        trace!(key, version, "committed");
        metrics::record_counter(metrics::STORE_COMMITS, 1);
        metrics::record_gauge(metrics::STORE_SIZE_BYTES, total_size as f64);

        if origin == Origin::Local {
            self.record_audit(Permission::Write, key, true);
        }

        let computed = self.propagate(&[key]);
        hooks::run_hook(self, &plugins, Hook::Set, key, Some(&*snapshot), version);

        if options.persist.unwrap_or(self.inner.config.persistence.persist_by_default) {
            self.mark_dirty(key);
        }
        if origin == Origin::Local && options.sync != Some(false) {
            self.queue_sync(key, &snapshot, version, now);
        }

        if !options.silent {
            let mut changes: Vec<Change> = Vec::with_capacity(computed.len() + 1);
            changes.push((
                ChangeEvent { key: key.to_string(), value: Some(snapshot), version, kind: ChangeKind::Set },
                previous,
            ));
            changes.extend(computed);
            self.emit(changes);
        }
        Ok(true)
    }

    /// `false` when the write must not commit
    fn check_limits(&self, key: &str, value: &Value) -> bool {
        let limits = &self.inner.config.store;
        let size = estimate_size(value);
        let violation = if size > limits.max_object_size {
            Some(StoreError::ObjectTooLarge { key: key.to_string(), size, limit: limits.max_object_size })
        } else {
            let projected = self.inner.state.read().projected_size(key, size);
            (projected > limits.max_total_size)
                .then(|| StoreError::StoreTooLarge { size: projected, limit: limits.max_total_size })
        };

        match violation {
            None => true,
            Some(err) => {
                self.report(err, ErrorContext::for_key("validation", key));
                limits.limit_policy == LimitPolicy::Warn
            }
        }
    }

    /// Current value of `key`, or of the computed key of that name
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        if !self.validate(key) || !self.authorize(key, Permission::Read) {
            return None;
        }

        let computed = self.inner.graph.lock().value(key);
        let (value, version) = match computed {
            Some(value) => (Some(value), 0),
            None => {
                let state = self.inner.state.read();
                match state.get(key, now_millis()) {
                    Some(entry) => (Some(entry.value.clone()), entry.version),
                    None => (None, 0),
                }
            }
        };

        let plugins = self.inner.hooks.read().plugins();
        if !plugins.is_empty() {
            hooks::run_hook(self, &plugins, Hook::Get, key, value.as_deref(), version);
        }
        value
    }

    /// Read and deserialize `key`
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key) {
            Some(value) => T::deserialize(&*value)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Remove `key`. `false` when it did not exist or access was denied.
    pub fn remove(&self, key: &str) -> bool {
        if !self.validate(key) || !self.authorize(key, Permission::Delete) {
            return false;
        }
        let now = now_millis();
        let removed = self.inner.state.write().remove(key);
        let Some(entry) = removed else {
            return false;
        };
        if entry.is_expired(now) {
            // Still on disk until the next flush deletes it
            self.mark_dirty(key);
            return false;
        }

        debug!(key, version = entry.version, "removed");
        self.record_audit(Permission::Delete, key, true);

        let computed = self.propagate(&[key]);
        let plugins = self.inner.hooks.read().plugins();
        hooks::run_hook(self, &plugins, Hook::Remove, key, Some(&*entry.value), entry.version);

        self.mark_dirty(key);
        if let Some(engine) = &self.inner.sync {
            engine.forget(key);
        }

        let mut changes: Vec<Change> = Vec::with_capacity(computed.len() + 1);
        changes.push((
            ChangeEvent { key: key.to_string(), value: None, version: entry.version, kind: ChangeKind::Removed },
            Some(entry.value),
        ));
        changes.extend(computed);
        self.emit(changes);
        true
    }

    /// Every live entry the current user may read
    pub fn list(&self) -> BTreeMap<String, Snapshot> {
        let all = self.inner.state.read().snapshot(now_millis());
        let access = self.inner.access.read();
        if access.is_empty() {
            return all;
        }
        let user = self.inner.user.read().clone();
        all.into_iter()
            .filter(|(key, _)| access.check(key, Permission::Read, user.as_deref()).is_allowed())
            .collect()
    }

    /// Version of `key`, 0 when absent
    pub fn version(&self, key: &str) -> u64 {
        self.inner.state.read().version(key, now_millis())
    }

    pub fn entry(&self, key: &str) -> Option<EntryInfo> {
        self.inner.state.read().get(key, now_millis()).map(EntryInfo::from)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.read().contains(key, now_millis())
    }

    /// Estimated size of all entries
    pub fn size(&self) -> usize {
        self.inner.state.read().total_size()
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().snapshot(now_millis()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose TTL elapsed. Returns the purged keys.
    pub fn purge_expired(&self) -> Vec<String> {
        let expired = self.inner.state.read().expired_keys(now_millis());
        if expired.is_empty() {
            return expired;
        }
        {
            let mut state = self.inner.state.write();
            for key in &expired {
                state.remove(key);
            }
        }
        for key in &expired {
            self.mark_dirty(key);
            if let Some(engine) = &self.inner.sync {
                engine.forget(key);
            }
        }
        let sources: Vec<&str> = expired.iter().map(String::as_str).collect();
        let computed = self.propagate(&sources);
        self.emit(computed);
        debug!(purged = expired.len(), "purged expired entries");
        expired
    }

    // ========================================================================
    // Computed values
    // ========================================================================

    /// Register a computed key (evaluated immediately) or return its cached value
    pub fn compute(
        &self,
        key: &str,
        selector: impl Fn(&Tracker<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Option<Snapshot> {
        if !self.validate(key) || !self.authorize(key, Permission::Read) {
            return None;
        }
        let registered = self.inner.graph.lock().register(key, Arc::new(selector));
        if registered {
            debug!(key, "registered computed key");
            if self.evaluate(key) {
                let value = self.inner.graph.lock().value(key);
                let mut changes: Vec<Change> = vec![(
                    ChangeEvent { key: key.to_string(), value, version: 0, kind: ChangeKind::Computed },
                    None,
                )];
                changes.extend(self.propagate(&[key]));
                self.emit(changes);
            }
        }
        self.inner.graph.lock().value(key)
    }

    /// Forget a computed key
    pub fn remove_computed(&self, key: &str) -> bool {
        self.inner.graph.lock().unregister(key)
    }

    /// Keys the computed key read during its last evaluation
    pub fn dependencies(&self, key: &str) -> Vec<String> {
        self.inner.graph.lock().dependencies(key).into_iter().collect()
    }

    /// Computed keys that read `key`
    pub fn dependents(&self, key: &str) -> Vec<String> {
        self.inner.graph.lock().dependents(key).into_iter().collect()
    }

    /// Evaluate one computed key. Returns whether its value changed.
    fn evaluate(&self, key: &str) -> bool {
        let Some(selector) = self.inner.graph.lock().selector(key) else {
            return false;
        };

        let tracker = Tracker::new(self);
        let result = catch_unwind(AssertUnwindSafe(|| selector(&tracker)));
        let reads = tracker.into_reads();

        let message = match result {
            Ok(Ok(value)) => {
                let mut graph = self.inner.graph.lock();
                graph.set_dependencies(key, reads);
                return graph.set_value(key, freeze_owned(value));
            }
            Ok(Err(err)) => format!("{:#}", err),
            Err(_) => "selector panicked".to_string(),
        };

        // Keep the last good value, but learn any new edges the failed run found
        {
            let mut graph = self.inner.graph.lock();
            let mut dependencies = graph.dependencies(key);
            dependencies.extend(reads);
            graph.set_dependencies(key, dependencies);
        }
        self.report(
            StoreError::Computed { key: key.to_string(), message },
            ErrorContext::for_key("computed", key),
        );
        false
    }

    /// Recompute everything downstream of `sources`
    fn propagate(&self, sources: &[&str]) -> Vec<Change> {
        let plan = self.inner.graph.lock().plan(sources.iter().copied());
        for key in &plan.cyclic {
            self.report(StoreError::DependencyCycle(key.clone()), ErrorContext::for_key("computed", key.clone()));
        }

        let mut changed: HashSet<String> = sources.iter().map(|s| s.to_string()).collect();
        let mut changes = Vec::new();
        for key in plan.order {
            let (dependencies, old) = {
                let graph = self.inner.graph.lock();
                (graph.dependencies(&key), graph.value(&key))
            };
            if !dependencies.iter().any(|d| changed.contains(d)) {
                continue;
            }
            if self.evaluate(&key) {
                let value = self.inner.graph.lock().value(&key);
                trace!(key = %key, "computed value changed");
                changed.insert(key.clone());
                changes.push((ChangeEvent { key, value, version: 0, kind: ChangeKind::Computed }, old));
            }
        }
        changes
    }

    // ========================================================================
    // Subscriptions and transactions
    // ========================================================================

    /// Listen to every change; coalesced to one call per transaction
    pub fn subscribe(&self, listener: impl Fn(&[ChangeEvent]) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.subscribers.lock().add_global(Arc::new(listener));
        Subscription::new(id, &self.inner.subscribers)
    }

    /// Listen to changes of one key, delivered as they happen
    pub fn subscribe_key(
        &self,
        key: &str,
        listener: impl Fn(&[ChangeEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.subscribers.lock().add_keyed(key, Arc::new(listener));
        Subscription::new(id, &self.inner.subscribers)
    }

    /// Receive `(new, old)` for every change of `key`
    pub fn watch(&self, key: &str, watcher: impl Fn(&WatchEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.subscribers.lock().add_watcher(key, Arc::new(watcher));
        Subscription::new(id, &self.inner.subscribers)
    }

    fn emit(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let reporter = &self.inner.reporter;

        for (event, old) in &changes {
            let (keyed, watchers) = {
                let subscribers = self.inner.subscribers.lock();
                (subscribers.keyed(&event.key), subscribers.watchers(&event.key))
            };
            deliver(&keyed, std::slice::from_ref(event), reporter, Some(&event.key));
            if !watchers.is_empty() {
                let watch_event =
                    WatchEvent { key: event.key.clone(), new: event.value.clone(), old: old.clone() };
                deliver_watch(&watchers, &watch_event, reporter);
            }
        }

        let events: Vec<ChangeEvent> = changes.into_iter().map(|(event, _)| event).collect();
        {
            let mut batch = self.inner.batch.lock();
            if batch.is_active() {
                for event in events {
                    batch.push(event);
                }
                return;
            }
        }
        let global = self.inner.subscribers.lock().global();
        deliver(&global, &events, reporter, None);
    }

    /// Run `f` with global notifications coalesced into one pass at the end
    pub fn transaction<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        let outermost = self.inner.batch.lock().begin();
        let guard = TransactionGuard { store: self };
        if outermost {
            let plugins = self.inner.hooks.read().plugins();
            hooks::run_transaction(self, &plugins, TransactionPhase::Start);
        }
        let result = f(self);
        drop(guard);
        result
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.batch.lock().is_active()
    }

    fn end_transaction(&self) {
        let Some(events) = self.inner.batch.lock().end() else {
            return;
        };
        if !events.is_empty() {
            let global = self.inner.subscribers.lock().global();
            deliver(&global, &events, &self.inner.reporter, None);
        }
        let plugins = self.inner.hooks.read().plugins();
        hooks::run_transaction(self, &plugins, TransactionPhase::End);
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    pub fn install(&self, plugin: impl Plugin + 'static) -> StoreResult<()> {
        self.install_arc(Arc::new(plugin))
    }

    pub fn install_arc(&self, plugin: Arc<dyn Plugin>) -> StoreResult<()> {
        self.inner.hooks.write().install(plugin.clone())?;
        let ctx = PluginContext::new(self, plugin.name());
        if let Err(err) = plugin.on_install(&ctx) {
            hooks::report_hook_error(self, plugin.as_ref(), "on_install", None, err);
        }
        info!(plugin = plugin.name(), namespace = self.namespace(), "installed plugin");
        Ok(())
    }

    /// Remove a plugin, running its `on_destroy`
    pub fn uninstall(&self, name: &str) -> bool {
        let removed = self.inner.hooks.write().uninstall(name);
        match removed {
            Some(plugin) => {
                if let Err(err) = plugin.on_destroy(self) {
                    hooks::report_hook_error(self, plugin.as_ref(), "on_destroy", None, err);
                }
                info!(plugin = name, "uninstalled plugin");
                true
            }
            None => false,
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.hooks.read().names()
    }

    /// Methods of an installed plugin
    pub fn plugin(&self, name: &str) -> Option<PluginHandle<'_>> {
        self.inner
            .hooks
            .read()
            .contains(name)
            .then(|| PluginHandle { store: self, name: name.to_string() })
    }

    /// Call `<plugin>.<method>` registered during `on_install`
    pub fn call_plugin(&self, plugin: &str, method: &str, args: Value) -> StoreResult<Value> {
        let f = self.inner.hooks.read().method(plugin, method)?;
        f(self, args).map_err(|err| StoreError::Plugin {
            plugin: plugin.to_string(),
            hook: "method",
            message: format!("{}: {:#}", method, err),
        })
    }

    pub(crate) fn register_plugin_method(&self, plugin: &str, method: &str, f: PluginMethod) {
        self.inner.hooks.write().register_method(plugin, method, f);
    }

    // ========================================================================
    // Access control and audit
    // ========================================================================

    fn authorize(&self, key: &str, action: Permission) -> bool {
        let user = self.inner.user.read().clone();
        let decision = self.inner.access.read().check(key, action, user.as_deref());
        if decision.is_allowed() {
            return true;
        }
        metrics::record_counter(metrics::ACCESS_DENIED, 1);
        let detail = match decision {
            Decision::NoMatchingRule => "no matching rule",
            _ => "permission not granted",
        };
        self.inner.audit.lock().record(action, key, user.as_deref(), false, Some(detail.to_string()));
        false
    }

    fn record_audit(&self, action: Permission, key: &str, success: bool) {
        let user = self.inner.user.read().clone();
        self.inner.audit.lock().record(action, key, user.as_deref(), success, None);
    }

    /// Replace the access rules. Invalid regexes are reported and never match.
    pub fn set_access_rules(&self, rules: Vec<AccessRule>) {
        let errors = self.inner.access.write().set_rules(rules);
        for err in errors {
            self.report(
                StoreError::Config(crate::config::ConfigError::InvalidValue(format!("access rule: {}", err))),
                ErrorContext::new("validation"),
            );
        }
    }

    pub fn add_access_rule(&self, rule: AccessRule) {
        let result = self.inner.access.write().add_rule(rule);
        if let Err(err) = result {
            self.report(
                StoreError::Config(crate::config::ConfigError::InvalidValue(format!("access rule: {}", err))),
                ErrorContext::new("validation"),
            );
        }
    }

    pub fn clear_access_rules(&self) {
        self.inner.access.write().clear();
    }

    /// User id handed to predicate rules and recorded in the audit log
    pub fn set_user(&self, user: Option<String>) {
        *self.inner.user.write() = user;
    }

    pub fn user(&self) -> Option<String> {
        self.inner.user.read().clone()
    }

    /// Evaluate the rules without side effects
    pub fn has_permission(&self, key: &str, action: Permission) -> bool {
        let user = self.inner.user.read().clone();
        self.inner.access.read().check(key, action, user.as_deref()).is_allowed()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.audit.lock().entries()
    }

    pub fn audit_failures(&self) -> Vec<AuditEntry> {
        self.inner.audit.lock().failures()
    }

    pub fn clear_audit(&self) {
        self.inner.audit.lock().clear();
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn mark_dirty(&self, key: &str) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        persistence.mark_dirty(key);
        match Handle::try_current() {
            Ok(runtime) => {
                let weak = self.downgrade();
                let delay = persistence.debounce();
                persistence.arm(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(store) = weak.upgrade() {
                        store.flush_now();
                    }
                }));
            }
            // No timer to coalesce with
            Err(_) => {
                self.flush_now();
            }
        }
    }

    fn flush_now(&self) -> FlushReport {
        let Some(persistence) = &self.inner.persistence else {
            return FlushReport::default();
        };
        let now = now_millis();
        let (report, errors) = persistence.flush(|key| self.inner.state.read().get(key, now).cloned());
        for (ctx, err) in errors {
            self.inner.reporter.report(&err, &ctx);
        }
        metrics::record_counter(metrics::PERSIST_FLUSHES, 1);
        report
    }

    /// Write every dirty key now instead of waiting for the debounce timer
    pub async fn flush_disk(&self) -> FlushReport {
        match &self.inner.persistence {
            Some(persistence) => {
                persistence.cancel_timer();
                self.flush_now()
            }
            None => FlushReport::default(),
        }
    }

    /// Keys waiting to be flushed
    pub fn dirty_keys(&self) -> Vec<String> {
        self.inner.persistence.as_ref().map(|p| p.dirty_keys()).unwrap_or_default()
    }

    /// Load persisted records into the store and mark it ready
    pub async fn hydrate(&self) -> HydrationReport {
        let Some(persistence) = &self.inner.persistence else {
            self.mark_ready();
            return HydrationReport::default();
        };

        let loaded = persistence.load();
        for (ctx, err) in &loaded.errors {
            self.inner.reporter.report(err, ctx);
        }

        let now = now_millis();
        let mut changes: Vec<Change> = Vec::with_capacity(loaded.records.len());
        let mut restored: Vec<String> = Vec::with_capacity(loaded.records.len());
        let mut invalid: Vec<String> = Vec::new();
        {
            let mut state = self.inner.state.write();
            for (key, record) in loaded.records {
                if !is_valid_key(&key) {
                    invalid.push(key);
                    continue;
                }
                let old = state.get(&key, now).map(|e| e.value.clone());
                let snapshot = freeze_owned(record.value);
                state.restore(&key, snapshot.clone(), record.version, record.timestamp, record.expires_at);
                let version = state.version(&key, now);
                changes.push((
                    ChangeEvent { key: key.clone(), value: Some(snapshot), version, kind: ChangeKind::Set },
                    old,
                ));
                restored.push(key);
            }
            metrics::record_gauge(metrics::STORE_SIZE_BYTES, state.total_size() as f64);
        }

        let failed = loaded.errors.len() + invalid.len();
        for key in invalid {
            self.report(StoreError::InvalidKey(key.clone()), ErrorContext::for_key("hydration", key));
        }

        let sources: Vec<&str> = restored.iter().map(String::as_str).collect();
        let computed = self.propagate(&sources);
        changes.extend(computed);

        // Rewrite migrated records at the current schema
        if loaded.migrated_from.is_some() {
            for key in restored.iter().chain(loaded.dropped.iter()) {
                self.mark_dirty(key);
            }
        }

        self.emit(changes);
        self.mark_ready();

        let report = HydrationReport {
            loaded: restored.len(),
            expired: loaded.expired.len(),
            failed,
            migrated_from: loaded.migrated_from,
        };
        info!(
            namespace = self.namespace(),
            loaded = report.loaded,
            expired = report.expired,
            failed = report.failed,
            "hydrated store"
        );
        report
    }

    fn mark_ready(&self) {
        self.inner.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Resolves once hydration finished
    pub async fn when_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives as long as the store
        let _ = ready.wait_for(|ready| *ready).await;
    }

    // ========================================================================
    // Sync
    // ========================================================================

    fn queue_sync(&self, key: &str, value: &Snapshot, version: u64, now: u64) {
        let Some(engine) = &self.inner.sync else {
            return;
        };
        if !engine.tracks(key) {
            return;
        }
        engine.queue_change(PendingChange {
            key: key.to_string(),
            value: value.clone(),
            local_timestamp: now,
            local_version: version,
        });
        if engine.is_online() {
            engine.schedule(self);
        }
    }

    pub(crate) fn schedule_sync(&self) {
        if let Some(engine) = &self.inner.sync {
            engine.schedule(self);
        }
    }

    /// Commit a reconciled value without queueing it for sync again
    pub(crate) fn apply_remote(&self, key: &str, value: Value) -> StoreResult<bool> {
        self.write(key, |_| value, &SetOptions::default().sync(false), Origin::Remote)
    }

    pub(crate) fn align_version(&self, key: &str, version: u64) -> bool {
        self.inner.state.write().align_version(key, version)
    }

    /// Run one sync cycle now
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        match &self.inner.sync {
            Some(engine) => engine.run_cycle(self).await,
            None => Err(SyncError::NotConfigured),
        }
    }

    /// Going online schedules a cycle for whatever queued while offline
    pub fn set_online(&self, online: bool) {
        if let Some(engine) = &self.inner.sync {
            engine.set_online(self, online);
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.sync.as_ref().map(|e| e.is_online()).unwrap_or(true)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.sync.as_ref().map(|e| e.is_syncing()).unwrap_or(false)
    }

    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.inner.sync.as_ref().map(|e| e.pending()).unwrap_or_default()
    }

    pub fn key_state(&self, key: &str) -> KeyState {
        self.inner.sync.as_ref().map(|e| e.key_state(key)).unwrap_or(KeyState::Clean)
    }

    /// Last version of `key` seen on the remote
    pub fn remote_version(&self, key: &str) -> Option<RemoteVersion> {
        self.inner.sync.as_ref().and_then(|e| e.remote_version(key))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush, stop timers, run every plugin's `on_destroy` and drop subscribers
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(persistence) = &self.inner.persistence {
            persistence.cancel_timer();
            self.flush_now();
        }
        if let Some(engine) = &self.inner.sync {
            engine.shutdown();
        }

        let plugins = self.inner.hooks.write().clear();
        for plugin in plugins {
            if let Err(err) = plugin.on_destroy(self) {
                hooks::report_hook_error(self, plugin.as_ref(), "on_destroy", None, err);
            }
        }
        self.inner.subscribers.lock().clear();
        registry::release(self);
        info!(namespace = self.namespace(), "store destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl ValueSource for Store {
    fn read(&self, key: &str) -> Option<Snapshot> {
        let computed = self.inner.graph.lock().value(key);
        computed.or_else(|| self.inner.state.read().get(key, now_millis()).map(|e| e.value.clone()))
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("namespace", &self.namespace())
            .field("entries", &self.inner.state.read().len())
            .field("ready", &self.is_ready())
            .finish()
    }
}
