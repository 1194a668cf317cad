/*
    errors.rs - Error types and the error channel

    Most failures never leave the store as `Err`: they are routed through
    the `ErrorReporter` with an `ErrorContext` naming the operation, and the
    public call degrades to `false`/`None`. `StoreError` is the payload of
    that channel as well as the error type of the few fallible APIs.
*/

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ConfigError;
use crate::sync::SyncError;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key does not match `[A-Za-z0-9_.-]{1,256}`
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Object too large: {key} is ~{size} bytes (limit {limit})")]
    ObjectTooLarge { key: String, size: usize, limit: usize },

    #[error("Store too large: ~{size} bytes (limit {limit})")]
    StoreTooLarge { size: usize, limit: usize },

    /// A plugin refused the write in `on_before_set`
    #[error("Write vetoed by plugin {plugin}: {reason}")]
    Vetoed { plugin: String, reason: String },

    /// A hook returned an error; isolated and reported
    #[error("Plugin {plugin} failed in {hook}: {message}")]
    Plugin { plugin: String, hook: &'static str, message: String },

    #[error("Plugin already installed: {0}")]
    PluginAlreadyInstalled(String),

    #[error("Plugin not installed: {0}")]
    PluginNotFound(String),

    #[error("Plugin {plugin} has no method {method}")]
    MethodNotFound { plugin: String, method: String },

    /// A selector failed; the previous computed value is kept
    #[error("Computed value {key} failed: {message}")]
    Computed { key: String, message: String },

    #[error("Dependency cycle involving computed key {0}")]
    DependencyCycle(String),

    /// A listener or watcher panicked
    #[error("Subscriber panicked: {0}")]
    Subscriber(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Migration from schema {from} to {to} failed: {message}")]
    Migration { from: u32, to: u32, message: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            StoreError::Deserialization(err.to_string())
        } else {
            StoreError::Serialization(err.to_string())
        }
    }
}

/// Where a reported error happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// e.g. `"hydration"`, `"plugin:audit:on_set"`
    pub operation: String,
    pub key: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        ErrorContext { operation: operation.into(), key: None }
    }

    pub fn for_key(operation: impl Into<String>, key: impl Into<String>) -> Self {
        ErrorContext { operation: operation.into(), key: Some(key.into()) }
    }

    pub fn plugin(plugin: &str, hook: &str, key: Option<&str>) -> Self {
        ErrorContext {
            operation: format!("plugin:{}:{}", plugin, hook),
            key: key.map(str::to_string),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} ({})", self.operation, key),
            None => f.write_str(&self.operation),
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(&StoreError, &ErrorContext) + Send + Sync>;

/// The error channel of one store instance
#[derive(Clone, Default)]
pub struct ErrorReporter {
    handler: Option<ErrorHandler>,
}

impl ErrorReporter {
    pub fn new(handler: Option<ErrorHandler>) -> Self {
        ErrorReporter { handler }
    }

    /// Route an error to the handler, or to `tracing` when none is configured
    pub fn report(&self, err: &StoreError, ctx: &ErrorContext) {
        match &self.handler {
            Some(handler) => handler(err, ctx),
            None => tracing::error!(operation = %ctx.operation, key = ?ctx.key, "{}", err),
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter").field("custom_handler", &self.handler.is_some()).finish()
    }
}
