//! Conflict model and resolution strategies

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::config::StrategyKind;

/// Local and remote sides of a diverged key
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub key: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_version: u64,
    pub remote_version: u64,
    pub local_timestamp: u64,
    pub remote_timestamp: u64,
}

/// Produces the reconciled value for a conflict
pub type MergeFn = Arc<dyn Fn(&ConflictInfo) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum ConflictStrategy {
    /// Force-push the local value with a version past the remote's
    AcceptLocal,
    /// Overwrite the local value and drop the pending change
    AcceptRemote,
    /// Write the merged value locally and push it with `max(local, remote) + 1`
    Merge(MergeFn),
    /// Drop the pending change and keep the local value unsynced
    Discard,
    /// Newer timestamp wins; ties go to the remote
    LastWriteWins,
}

impl ConflictStrategy {
    /// Strategy for a configured kind. `Merge` needs a function and is
    /// never produced here.
    pub fn from_kind(kind: StrategyKind) -> Option<Self> {
        match kind {
            StrategyKind::AcceptLocal => Some(ConflictStrategy::AcceptLocal),
            StrategyKind::AcceptRemote => Some(ConflictStrategy::AcceptRemote),
            StrategyKind::Discard => Some(ConflictStrategy::Discard),
            StrategyKind::LastWriteWins => Some(ConflictStrategy::LastWriteWins),
            StrategyKind::Merge => None,
        }
    }

    /// Decide what to do with one conflict
    pub fn resolve(&self, info: &ConflictInfo) -> Resolution {
        match self {
            ConflictStrategy::AcceptLocal => Resolution::KeepLocal,
            ConflictStrategy::AcceptRemote => Resolution::TakeRemote,
            ConflictStrategy::Merge(merge) => Resolution::Merged(merge(info)),
            ConflictStrategy::Discard => Resolution::Discarded,
            ConflictStrategy::LastWriteWins => {
                if info.local_timestamp > info.remote_timestamp {
                    Resolution::KeepLocal
                } else {
                    Resolution::TakeRemote
                }
            }
        }
    }
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::LastWriteWins
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::AcceptLocal => "AcceptLocal",
            ConflictStrategy::AcceptRemote => "AcceptRemote",
            ConflictStrategy::Merge(_) => "Merge",
            ConflictStrategy::Discard => "Discard",
            ConflictStrategy::LastWriteWins => "LastWriteWins",
        };
        f.write_str(name)
    }
}

/// Outcome of one conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
    Merged(Value),
    Discarded,
}
