/*
    snapshot.rs - Immutable value snapshots

    Every committed value is a structural copy of what the caller handed in,
    wrapped in an `Arc` so readers share it without being able to mutate it.
    Mutation only happens on a caller-owned draft (see `Store::update`).

    Size estimates follow the usual rough accounting: 2 bytes per string
    character, 8 per number, 4 per boolean, plus object key names.
*/

use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A frozen, shareable value
pub type Snapshot = Arc<Value>;

/// Copy `value` into a new frozen snapshot
pub fn freeze(value: &Value) -> Snapshot {
    Arc::new(value.clone())
}

/// Freeze a value the caller already gave up
pub fn freeze_owned(value: Value) -> Snapshot {
    Arc::new(value)
}

/// Mutable working copy of a snapshot (or `null` when there is none)
pub fn draft(current: Option<&Snapshot>) -> Value {
    current.map(|snapshot| Value::clone(snapshot)).unwrap_or(Value::Null)
}

/// Deep structural equality
pub fn deep_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    a == b
}

/// Rough in-memory footprint of a value
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.chars().count() * 2,
        Value::Array(items) => items.iter().map(estimate_size).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.chars().count() * 2 + estimate_size(v)).sum(),
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
