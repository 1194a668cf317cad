//! Server state shared across requests

use std::sync::Arc;

use crate::sync::remote::MemoryRemote;

#[derive(Clone, Default)]
pub struct AppState {
    /// Replica backing both endpoints
    pub remote: Arc<MemoryRemote>,
}

impl AppState {
    pub fn new(remote: Arc<MemoryRemote>) -> Self {
        Self { remote }
    }
}
