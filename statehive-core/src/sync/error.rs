//! Sync error types

use thiserror::Error;

/// Errors raised by the sync engine and its remotes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("A sync cycle is already in progress")]
    AlreadySyncing,

    #[error("Store is offline")]
    Offline,

    #[error("Sync is not configured for this store")]
    NotConfigured,

    /// The remote could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The remote answered with something that is not the sync protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Push of {key} failed after {attempts} attempts: {message}")]
    RetriesExhausted { key: String, attempts: u32, message: String },

    /// The local store refused to apply a reconciled value
    #[error("Local write of {key} failed: {message}")]
    LocalWrite { key: String, message: String },
}

impl SyncError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Protocol(err.to_string())
        } else {
            match err.status() {
                Some(status) => SyncError::Status { status: status.as_u16(), message: err.to_string() },
                None => SyncError::Transport(err.to_string()),
            }
        }
    }
}
