/*
    Hook pipeline - plugins and their lifecycle interception points

    Plugins run in installation order. Every hook returns a `Result`; an
    `Err` is reported on the store's error channel under
    `plugin:<name>:<hook>` and the pipeline moves on to the next plugin.

    The only way to stop a write is an explicit `BeforeSet::Veto` returned
    from `on_before_set`. Returning `Err` there is isolated like any other
    hook failure and does not veto.
*/

pub mod access;
pub mod audit;

pub use access::{AccessGate, AccessRule, Decision, KeyPattern, Permission};
pub use audit::{AuditEntry, AuditLog};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::errors::{ErrorContext, StoreError, StoreResult};
use crate::store::Store;

/// What a hook sees about the operation in flight
pub struct HookContext<'a> {
    pub key: &'a str,
    /// Proposed value in `on_before_set`, committed value in `on_set`/`on_get`,
    /// removed value in `on_remove`
    pub value: Option<&'a Value>,
    pub store: &'a Store,
    /// Current version (the version being replaced for `on_before_set`)
    pub version: u64,
}

/// Outcome of `on_before_set`
#[derive(Debug, Clone, PartialEq)]
pub enum BeforeSet {
    Continue,
    /// Substitute the value seen by later plugins and committed
    Replace(Value),
    /// Abort the write; `set` returns `StoreError::Vetoed`
    Veto(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Start,
    End,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPhase::Start => "START",
            TransactionPhase::End => "END",
        }
    }
}

/// A custom method exposed by a plugin, called via `Store::call_plugin`
pub type PluginMethod = Arc<dyn Fn(&Store, Value) -> anyhow::Result<Value> + Send + Sync>;

/// Passed to `on_install`
pub struct PluginContext<'a> {
    pub store: &'a Store,
    plugin: &'a str,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(store: &'a Store, plugin: &'a str) -> Self {
        PluginContext { store, plugin }
    }

    /// Expose `method` as `<plugin>.<method>` on this store only
    pub fn register_method(
        &self,
        method: &str,
        f: impl Fn(&Store, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        self.store.register_plugin_method(self.plugin, method, Arc::new(f));
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_install(&self, _ctx: &PluginContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_before_set(&self, _ctx: &HookContext<'_>) -> anyhow::Result<BeforeSet> {
        Ok(BeforeSet::Continue)
    }

    fn on_set(&self, _ctx: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_get(&self, _ctx: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_remove(&self, _ctx: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs on `Store::uninstall` and `Store::destroy`
    fn on_destroy(&self, _store: &Store) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fires once at the start and once at the end of the outermost transaction
    fn on_transaction(&self, _phase: TransactionPhase, _store: &Store) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Installed plugins and their method registry, owned by one store
#[derive(Default)]
pub struct HookPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
    methods: HashMap<String, HashMap<String, PluginMethod>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, plugin: Arc<dyn Plugin>) -> StoreResult<()> {
        if self.contains(plugin.name()) {
            return Err(StoreError::PluginAlreadyInstalled(plugin.name().to_string()));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn uninstall(&mut self, name: &str) -> Option<Arc<dyn Plugin>> {
        let index = self.plugins.iter().position(|p| p.name() == name)?;
        self.methods.remove(name);
        Some(self.plugins.remove(index))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    /// Installed plugins in order; cloned so hooks run without the lock
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn register_method(&mut self, plugin: &str, method: &str, f: PluginMethod) {
        self.methods.entry(plugin.to_string()).or_default().insert(method.to_string(), f);
    }

    pub fn method(&self, plugin: &str, method: &str) -> StoreResult<PluginMethod> {
        if !self.contains(plugin) {
            return Err(StoreError::PluginNotFound(plugin.to_string()));
        }
        self.methods.get(plugin).and_then(|m| m.get(method)).cloned().ok_or_else(|| {
            StoreError::MethodNotFound { plugin: plugin.to_string(), method: method.to_string() }
        })
    }

    pub fn clear(&mut self) -> Vec<Arc<dyn Plugin>> {
        self.methods.clear();
        std::mem::take(&mut self.plugins)
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Report a failed hook on the store's error channel
pub(crate) fn report_hook_error(
    store: &Store,
    plugin: &dyn Plugin,
    hook: &'static str,
    key: Option<&str>,
    err: anyhow::Error,
) {
    tracing::warn!(plugin = plugin.name(), hook, key, error = %err, "plugin hook failed");
    store.reporter().report(
        &StoreError::Plugin {
            plugin: plugin.name().to_string(),
            hook,
            message: format!("{:#}", err),
        },
        &ErrorContext::plugin(plugin.name(), hook, key),
    );
}

/// Run `on_before_set` across `plugins`. Returns the (possibly replaced)
/// value, or `Vetoed` from the first plugin that refuses.
pub(crate) fn run_before_set(
    store: &Store,
    plugins: &[Arc<dyn Plugin>],
    key: &str,
    mut value: Value,
    version: u64,
) -> StoreResult<Value> {
    for plugin in plugins {
        let ctx = HookContext { key, value: Some(&value), store, version };
        match plugin.on_before_set(&ctx) {
            Ok(BeforeSet::Continue) => {}
            Ok(BeforeSet::Replace(replacement)) => value = replacement,
            Ok(BeforeSet::Veto(reason)) => {
                tracing::debug!(plugin = plugin.name(), key, %reason, "write vetoed");
                return Err(StoreError::Vetoed { plugin: plugin.name().to_string(), reason });
            }
            Err(err) => report_hook_error(store, plugin.as_ref(), "on_before_set", Some(key), err),
        }
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Hook {
    Set,
    Get,
    Remove,
}

pub(crate) fn run_hook(
    store: &Store,
    plugins: &[Arc<dyn Plugin>],
    hook: Hook,
    key: &str,
    value: Option<&Value>,
    version: u64,
) {
    for plugin in plugins {
        let ctx = HookContext { key, value, store, version };
        let (name, result) = match hook {
            Hook::Set => ("on_set", plugin.on_set(&ctx)),
            Hook::Get => ("on_get", plugin.on_get(&ctx)),
            Hook::Remove => ("on_remove", plugin.on_remove(&ctx)),
        };
        if let Err(err) = result {
            report_hook_error(store, plugin.as_ref(), name, Some(key), err);
        }
    }
}

pub(crate) fn run_transaction(store: &Store, plugins: &[Arc<dyn Plugin>], phase: TransactionPhase) {
    for plugin in plugins {
        if let Err(err) = plugin.on_transaction(phase, store) {
            report_hook_error(store, plugin.as_ref(), "on_transaction", None, err);
        }
    }
}
