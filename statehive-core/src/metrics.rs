//! Metrics names and recording helpers
//!
//! No exporter is installed here; embedders plug in any `metrics` recorder.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const STORE_COMMITS: &str = "statehive.store.commits";
pub const STORE_NOOP_WRITES: &str = "statehive.store.noop_writes";
pub const STORE_SIZE_BYTES: &str = "statehive.store.size_bytes";
pub const ACCESS_DENIED: &str = "statehive.access.denied";
pub const PERSIST_FLUSHES: &str = "statehive.persist.flushes";
pub const SYNC_PUSHED: &str = "statehive.sync.pushed";
pub const SYNC_CONFLICTS: &str = "statehive.sync.conflicts";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(STORE_COMMITS, "Committed writes");
    describe_counter!(STORE_NOOP_WRITES, "Writes skipped because the value did not change");
    describe_gauge!(STORE_SIZE_BYTES, "Estimated size of all live entries");
    describe_counter!(ACCESS_DENIED, "Operations refused by access rules");
    describe_counter!(PERSIST_FLUSHES, "Persistence flushes");
    describe_counter!(SYNC_PUSHED, "Keys pushed to the remote replica");
    describe_counter!(SYNC_CONFLICTS, "Sync conflicts resolved");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}
