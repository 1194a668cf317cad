/*
    computed.rs - Dependency graph and computed-value cache

    A computed key is a selector plus its last good value. Dependencies are
    discovered while the selector runs: every `Tracker::get` is recorded,
    and after each evaluation the recorded set replaces the previous one.
    The reverse index (dependency -> dependents) is rewritten in the same
    step, so stale edges never survive an evaluation.

    Propagation order comes from `ComputedGraph::plan`: the transitive
    dependents of the changed keys, topologically sorted so every node is
    evaluated after all of its affected dependencies. Nodes that sit on (or
    behind) a cycle are returned separately and never evaluated.

    The graph only stores key names and computed values. It never holds a
    lock while a selector runs; the store drives evaluation.
*/

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::snapshot::Snapshot;

/// Derivation function of a computed key
pub type Selector = Arc<dyn Fn(&Tracker<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// Where a tracker reads from
pub trait ValueSource {
    fn read(&self, key: &str) -> Option<Snapshot>;
}

/// Accessor handed to a selector; records every key it reads
pub struct Tracker<'a> {
    source: &'a dyn ValueSource,
    reads: RefCell<BTreeSet<String>>,
}

impl<'a> Tracker<'a> {
    pub fn new(source: &'a dyn ValueSource) -> Self {
        Tracker { source, reads: RefCell::new(BTreeSet::new()) }
    }

    /// Read `key` and record it as a dependency
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        self.reads.borrow_mut().insert(key.to_string());
        self.source.read(key)
    }

    /// Read `key`, `Value::Null` when absent
    pub fn value(&self, key: &str) -> Value {
        self.get(key).map(|v| Value::clone(&v)).unwrap_or(Value::Null)
    }

    /// Read and deserialize `key`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(T::deserialize(&*value)?)),
            None => Ok(None),
        }
    }

    /// Keys read so far
    pub fn into_reads(self) -> BTreeSet<String> {
        self.reads.into_inner()
    }
}

struct ComputedEntry {
    selector: Selector,
    value: Option<Snapshot>,
    dependencies: BTreeSet<String>,
}

/// Evaluation order for one propagation pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub order: Vec<String>,
    /// Affected keys that could not be ordered because of a cycle
    pub cyclic: Vec<String>,
}

#[derive(Default)]
pub struct ComputedGraph {
    entries: HashMap<String, ComputedEntry>,
    dependents: HashMap<String, BTreeSet<String>>,
}

impl ComputedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Register a computed key; returns `false` if it already exists
    pub fn register(&mut self, key: &str, selector: Selector) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(
            key.to_string(),
            ComputedEntry { selector, value: None, dependencies: BTreeSet::new() },
        );
        true
    }

    /// Drop a computed key and all of its outgoing edges
    pub fn unregister(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        for dependency in &entry.dependencies {
            self.unlink(dependency, key);
        }
        true
    }

    pub fn selector(&self, key: &str) -> Option<Selector> {
        self.entries.get(key).map(|entry| entry.selector.clone())
    }

    pub fn value(&self, key: &str) -> Option<Snapshot> {
        self.entries.get(key).and_then(|entry| entry.value.clone())
    }

    /// Store a freshly computed value; `true` when it differs from the cached one
    pub fn set_value(&mut self, key: &str, value: Snapshot) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let changed = entry.value.as_deref() != Some(&*value);
        if changed {
            entry.value = Some(value);
        }
        changed
    }

    /// Replace the dependency set of `key`, pruning and adding reverse edges
    pub fn set_dependencies(&mut self, key: &str, dependencies: BTreeSet<String>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let previous = std::mem::replace(&mut entry.dependencies, dependencies.clone());

        for stale in previous.difference(&dependencies) {
            self.unlink(stale, key);
        }
        for added in dependencies.difference(&previous) {
            self.dependents.entry(added.clone()).or_default().insert(key.to_string());
        }
    }

    pub fn dependencies(&self, key: &str) -> BTreeSet<String> {
        self.entries.get(key).map(|entry| entry.dependencies.clone()).unwrap_or_default()
    }

    pub fn dependents(&self, key: &str) -> BTreeSet<String> {
        self.dependents.get(key).cloned().unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Order in which the dependents of `sources` must be re-evaluated
    pub fn plan<'s>(&self, sources: impl IntoIterator<Item = &'s str>) -> Plan {
        // Transitive closure of dependents, breadth-first
        let mut affected: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for source in sources {
            queue.extend(self.dependents(source));
        }
        while let Some(key) = queue.pop_front() {
            if !self.entries.contains_key(&key) || !affected.insert(key.clone()) {
                continue;
            }
            queue.extend(self.dependents(&key));
        }

        // Kahn's algorithm restricted to the affected subgraph
        let mut in_degree: HashMap<&str, usize> = affected
            .iter()
            .map(|key| {
                let degree =
                    self.entries[key].dependencies.iter().filter(|d| affected.contains(*d)).count();
                (key.as_str(), degree)
            })
            .collect();

        let mut ready: BTreeSet<&str> =
            in_degree.iter().filter(|(_, degree)| **degree == 0).map(|(key, _)| *key).collect();
        let mut order = Vec::with_capacity(affected.len());

        while let Some(key) = ready.pop_first() {
            in_degree.remove(key);
            order.push(key.to_string());
            for dependent in self.dependents.get(key).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        let mut cyclic: Vec<String> = in_degree.into_keys().map(str::to_string).collect();
        cyclic.sort();
        Plan { order, cyclic }
    }

    fn unlink(&mut self, dependency: &str, dependent: &str) {
        if let Some(set) = self.dependents.get_mut(dependency) {
            set.remove(dependent);
            if set.is_empty() {
                self.dependents.remove(dependency);
            }
        }
    }
}
