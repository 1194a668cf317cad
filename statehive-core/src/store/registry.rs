//! Process-wide store registry
//!
//! Convenience lookup of store handles by namespace for call sites that
//! cannot thread a handle through. Nothing is registered implicitly and
//! each namespace maps to exactly one store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::errors::{StoreError, StoreResult};
use super::Store;

static REGISTRY: OnceLock<Mutex<HashMap<String, Store>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Store>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `store` under its namespace
pub fn init(store: Store) -> StoreResult<Store> {
    let mut stores = registry().lock();
    let namespace = store.namespace().to_string();
    if stores.contains_key(&namespace) {
        return Err(StoreError::Registry(format!("namespace {} is already registered", namespace)));
    }
    stores.insert(namespace, store.clone());
    Ok(store)
}

pub fn get(namespace: &str) -> Option<Store> {
    registry().lock().get(namespace).cloned()
}

/// Unregister and return the store of `namespace`
pub fn teardown(namespace: &str) -> Option<Store> {
    registry().lock().remove(namespace)
}

pub fn namespaces() -> Vec<String> {
    let mut namespaces: Vec<String> = registry().lock().keys().cloned().collect();
    namespaces.sort();
    namespaces
}

/// Drop `store` from the registry if it is the registered one
pub(crate) fn release(store: &Store) {
    let mut stores = registry().lock();
    if stores.get(store.namespace()).map(|s| s.ptr_eq(store)).unwrap_or(false) {
        stores.remove(store.namespace());
    }
}
