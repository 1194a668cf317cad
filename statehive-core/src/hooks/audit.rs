//! Per-store audit trail of access decisions and mutations

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::access::Permission;
use crate::store::snapshot::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub action: Permission,
    pub key: String,
    pub user: Option<String>,
    pub success: bool,
    pub detail: Option<String>,
}

/// Bounded ring of audit entries; the oldest entry is evicted first
#[derive(Debug)]
pub struct AuditLog {
    enabled: bool,
    max_entries: usize,
    entries: VecDeque<AuditEntry>,
}

impl AuditLog {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        AuditLog { enabled, max_entries: max_entries.max(1), entries: VecDeque::new() }
    }

    pub fn record(
        &mut self,
        action: Permission,
        key: &str,
        user: Option<&str>,
        success: bool,
        detail: Option<String>,
    ) {
        if !success {
            tracing::warn!(%action, key, user, "access denied");
        }
        if !self.enabled {
            return;
        }
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(AuditEntry {
            timestamp: now_millis(),
            action,
            key: key.to_string(),
            user: user.map(str::to_string),
            success,
            detail,
        });
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn failures(&self) -> Vec<AuditEntry> {
        self.entries.iter().filter(|e| !e.success).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
