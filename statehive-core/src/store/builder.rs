//! Store construction
//!
//! `Config` carries everything serialisable; collaborators that are code
//! (storage, transforms, remotes, callbacks, predicate rules, plugins) are
//! attached here.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;

use super::computed::ComputedGraph;
use super::errors::{ErrorContext, ErrorHandler, ErrorReporter, StoreError, StoreResult};
use super::notify::{Batch, Subscribers};
use super::versioned::VersionedMap;
use super::{Store, StoreInner};
use crate::config::{Config, ConfigError, StrategyKind};
use crate::hooks::{AccessGate, AccessRule, AuditLog, HookPipeline, Plugin};
use crate::persist::{
    EncryptionTransform, MemoryStorage, MigrateFn, PersistenceCoordinator, StorageAdapter, ValueTransform,
};
use crate::sync::{ConflictInfo, ConflictStrategy, HttpRemote, MergeFn, SyncCallback, SyncEngine, SyncReport, SyncRemote};

pub struct StoreBuilder {
    config: Config,
    storage: Option<Arc<dyn StorageAdapter>>,
    transform: Option<Arc<dyn ValueTransform>>,
    migrate: Option<MigrateFn>,
    remote: Option<Arc<dyn SyncRemote>>,
    strategy: Option<ConflictStrategy>,
    merge: Option<MergeFn>,
    on_error: Option<ErrorHandler>,
    on_sync_complete: Option<SyncCallback>,
    access_rules: Vec<AccessRule>,
    plugins: Vec<Arc<dyn Plugin>>,
    user: Option<String>,
}

impl StoreBuilder {
    pub fn new(config: Config) -> Self {
        StoreBuilder {
            config,
            storage: None,
            transform: None,
            migrate: None,
            remote: None,
            strategy: None,
            merge: None,
            on_error: None,
            on_sync_complete: None,
            access_rules: Vec::new(),
            plugins: Vec::new(),
            user: None,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.store.namespace = namespace.into();
        self
    }

    /// Persist to `storage`; enables persistence
    pub fn storage(mut self, storage: impl StorageAdapter + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self.config.persistence.enabled = true;
        self
    }

    pub fn storage_arc(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self.config.persistence.enabled = true;
        self
    }

    /// Encode persisted payloads; overrides `persistence.encrypt`
    pub fn transform(mut self, transform: impl ValueTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Rewrite hydrated data whose schema is behind `persistence.schema_version`
    pub fn migration(
        mut self,
        migrate: impl Fn(&mut BTreeMap<String, Value>, u32, u32) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    /// Sync against `remote`; enables sync
    pub fn remote(mut self, remote: impl SyncRemote + 'static) -> Self {
        self.remote = Some(Arc::new(remote));
        self.config.sync.enabled = true;
        self
    }

    pub fn remote_arc(mut self, remote: Arc<dyn SyncRemote>) -> Self {
        self.remote = Some(remote);
        self.config.sync.enabled = true;
        self
    }

    /// Overrides `sync.strategy`
    pub fn strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Merge function used when `sync.strategy` is `merge`
    pub fn merge(mut self, merge: impl Fn(&ConflictInfo) -> Value + Send + Sync + 'static) -> Self {
        self.merge = Some(Arc::new(merge));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&StoreError, &ErrorContext) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn on_sync_complete(mut self, callback: impl Fn(&SyncReport) + Send + Sync + 'static) -> Self {
        self.on_sync_complete = Some(Arc::new(callback));
        self
    }

    pub fn access_rules(mut self, rules: Vec<AccessRule>) -> Self {
        self.access_rules = rules;
        self
    }

    pub fn access_rule(mut self, rule: AccessRule) -> Self {
        self.access_rules.push(rule);
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn plugin_arc(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn build(self) -> StoreResult<Store> {
        self.config.validate()?;
        let namespace = self.config.store.namespace.clone();
        let reporter = ErrorReporter::new(self.on_error.clone());

        let persistence = if self.config.persistence.enabled {
            let adapter = self.storage.clone().unwrap_or_else(|| Arc::new(MemoryStorage::new()));
            let transform = match self.transform.clone() {
                Some(transform) => Some(transform),
                None if self.config.persistence.encrypt => Some(self.passphrase_transform(&namespace)?),
                None => None,
            };
            Some(PersistenceCoordinator::new(
                adapter,
                transform,
                &namespace,
                self.config.persistence.debounce,
                self.config.persistence.schema_version,
                self.migrate.clone(),
            ))
        } else {
            None
        };

        let sync = if self.config.sync.enabled {
            let remote = self.sync_remote()?;
            let strategy = self.conflict_strategy()?;
            Some(SyncEngine::new(remote, strategy, &self.config.sync, self.on_sync_complete.clone())?)
        } else {
            None
        };

        let ready = persistence.is_none();
        let audit = AuditLog::new(self.config.audit.enabled, self.config.audit.max_entries);
        let (ready_tx, _) = watch::channel(ready);

        let store = Store {
            inner: Arc::new(StoreInner {
                state: RwLock::new(VersionedMap::new()),
                graph: Mutex::new(ComputedGraph::new()),
                subscribers: Arc::new(Mutex::new(Subscribers::default())),
                batch: Mutex::new(Batch::default()),
                hooks: RwLock::new(HookPipeline::new()),
                access: RwLock::new(AccessGate::new()),
                audit: Mutex::new(audit),
                user: RwLock::new(self.user),
                reporter,
                persistence,
                sync,
                ready: ready_tx,
                destroyed: AtomicBool::new(false),
                config: self.config,
            }),
        };

        if !self.access_rules.is_empty() {
            store.set_access_rules(self.access_rules);
        }
        for plugin in self.plugins {
            store.install_arc(plugin)?;
        }
        if let Some(engine) = &store.inner.sync {
            engine.start_periodic(&store);
        }

        tracing::info!(
            namespace = %namespace,
            persistence = store.inner.persistence.is_some(),
            sync = store.inner.sync.is_some(),
            "store created"
        );
        Ok(store)
    }

    /// Build, then hydrate from storage
    pub async fn open(self) -> StoreResult<Store> {
        let store = self.build()?;
        store.hydrate().await;
        Ok(store)
    }

    fn passphrase_transform(&self, namespace: &str) -> StoreResult<Arc<dyn ValueTransform>> {
        let var = &self.config.persistence.passphrase_env;
        let passphrase = std::env::var(var).map_err(|_| {
            ConfigError::InvalidValue(format!("encryption enabled but {} is not set", var))
        })?;
        Ok(Arc::new(EncryptionTransform::from_passphrase(&passphrase, namespace)?))
    }

    fn sync_remote(&self) -> StoreResult<Arc<dyn SyncRemote>> {
        if let Some(remote) = &self.remote {
            return Ok(remote.clone());
        }
        match &self.config.sync.endpoint {
            Some(endpoint) => Ok(Arc::new(HttpRemote::new(endpoint.as_str())?)),
            None => Err(ConfigError::Rejected(
                "sync is enabled but neither a remote nor an endpoint is configured".to_string(),
            )
            .into()),
        }
    }

    fn conflict_strategy(&self) -> StoreResult<ConflictStrategy> {
        if let Some(strategy) = &self.strategy {
            return Ok(strategy.clone());
        }
        match self.config.sync.strategy {
            StrategyKind::Merge => match &self.merge {
                Some(merge) => Ok(ConflictStrategy::Merge(merge.clone())),
                None => Err(ConfigError::Rejected(
                    "merge strategy requires a merge function".to_string(),
                )
                .into()),
            },
            kind => ConflictStrategy::from_kind(kind)
                .ok_or_else(|| ConfigError::InvalidValue(format!("unsupported strategy {:?}", kind)).into()),
        }
    }
}
