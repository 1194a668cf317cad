/*
    Subsystem tests for the store

    - store_tests: versioning, idempotence, drafts, limits, TTL
    - computed_tests: dependency discovery, propagation order, failures, cycles
    - notify_tests: transactions, subscribers, listener isolation
    - hooks_tests: plugin pipeline, vetoes, access control, audit
    - persistence_tests: flush, hydration, migration, encryption
    - sync_tests: conflict strategies, retries, offline queue
*/

pub mod notify_tests;
pub mod store_tests;
pub mod sync_tests;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::store::errors::{ErrorContext, StoreError};

/// Collects everything a store reports on its error channel
#[derive(Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<(String, ErrorContext)>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl Fn(&StoreError, &ErrorContext) + Send + Sync + 'static {
        let entries = self.entries.clone();
        move |err, ctx| entries.lock().push((err.to_string(), ctx.clone()))
    }

    pub fn operations(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(_, ctx)| ctx.operation.clone()).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(msg, _)| msg.clone()).collect()
    }

    pub fn contexts(&self) -> Vec<ErrorContext> {
        self.entries.lock().iter().map(|(_, ctx)| ctx.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
