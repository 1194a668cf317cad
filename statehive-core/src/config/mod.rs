//! Configuration management for statehive
//!
//! A `Config` can be loaded from a TOML file or from environment variables
//! of the form `STATEHIVE_<SECTION>_<KEY>`. Collaborators that cannot be
//! serialized (storage adapters, transforms, remotes, callbacks) are handed
//! to [`crate::StoreBuilder`] instead.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::store::key::is_valid_key;

/// Main store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub persistence: PersistenceConfig,
    pub sync: SyncConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

/// What to do when an object or the whole store exceeds its size budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPolicy {
    /// Report through the error channel and commit anyway
    #[default]
    Warn,
    /// Report and refuse the write
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Instance namespace; also the storage key prefix
    pub namespace: String,

    /// Advisory per-value size estimate limit in bytes
    pub max_object_size: usize,

    /// Advisory whole-store size estimate limit in bytes
    pub max_total_size: usize,

    pub limit_policy: LimitPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,

    /// Write-behind debounce delay
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Schema version written into every record; hydration migrates older data up to it
    pub schema_version: u32,

    /// Whether writes without an explicit `persist` option are persisted
    pub persist_by_default: bool,

    /// Encrypt payloads with a passphrase read from `passphrase_env`
    pub encrypt: bool,

    pub passphrase_env: String,
}

/// Conflict strategies that can be named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    AcceptLocal,
    AcceptRemote,
    /// Requires a merge function on the builder
    Merge,
    Discard,
    #[default]
    LastWriteWins,
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept-local" => Ok(StrategyKind::AcceptLocal),
            "accept-remote" => Ok(StrategyKind::AcceptRemote),
            "merge" => Ok(StrategyKind::Merge),
            "discard" => Ok(StrategyKind::Discard),
            "last-write-wins" => Ok(StrategyKind::LastWriteWins),
            other => Err(ConfigError::InvalidValue(format!("Unknown sync strategy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,

    /// Base URL of the remote replica, used when no remote is given to the builder
    pub endpoint: Option<String>,

    /// Delay between the last queued change and the automatic sync cycle
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Optional periodic sync cycle
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Push retries after the first failed attempt
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    pub strategy: StrategyKind,

    /// Regexes selecting synced keys; `None` syncs every key
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            max_object_size: 1024 * 1024,       // 1 MB
            max_total_size: 10 * 1024 * 1024, // 10 MB
            limit_policy: LimitPolicy::Warn,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: Duration::from_millis(100),
            schema_version: 1,
            persist_by_default: true,
            encrypt: false,
            passphrase_env: "STATEHIVE_PASSPHRASE".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            debounce: Duration::from_millis(500),
            interval: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            strategy: StrategyKind::LastWriteWins,
            keys: None,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true, max_entries: 1000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Configuration with the given namespace and defaults elsewhere
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.store.namespace = namespace.into();
        config
    }

    /// Load configuration from environment variables
    ///
    /// Example: `STATEHIVE_SYNC_ENDPOINT=https://sync.example.com`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(namespace) = env::var("STATEHIVE_STORE_NAMESPACE") {
            config.store.namespace = namespace;
        }
        if let Some(size) = env_parse("STATEHIVE_STORE_MAX_OBJECT_SIZE")? {
            config.store.max_object_size = size;
        }
        if let Some(size) = env_parse("STATEHIVE_STORE_MAX_TOTAL_SIZE")? {
            config.store.max_total_size = size;
        }

        if let Some(enabled) = env_parse("STATEHIVE_PERSISTENCE_ENABLED")? {
            config.persistence.enabled = enabled;
        }
        if let Some(ms) = env_parse::<u64>("STATEHIVE_PERSISTENCE_DEBOUNCE_MS")? {
            config.persistence.debounce = Duration::from_millis(ms);
        }
        if let Some(version) = env_parse("STATEHIVE_PERSISTENCE_SCHEMA_VERSION")? {
            config.persistence.schema_version = version;
        }
        if let Some(encrypt) = env_parse("STATEHIVE_PERSISTENCE_ENCRYPT")? {
            config.persistence.encrypt = encrypt;
        }

        if let Some(enabled) = env_parse("STATEHIVE_SYNC_ENABLED")? {
            config.sync.enabled = enabled;
        }
        if let Ok(endpoint) = env::var("STATEHIVE_SYNC_ENDPOINT") {
            config.sync.endpoint = Some(endpoint);
        }
        if let Some(retries) = env_parse("STATEHIVE_SYNC_MAX_RETRIES")? {
            config.sync.max_retries = retries;
        }
        if let Some(strategy) = env_parse("STATEHIVE_SYNC_STRATEGY")? {
            config.sync.strategy = strategy;
        }

        if let Ok(level) = env::var("STATEHIVE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = env_parse("STATEHIVE_LOG_JSON")? {
            config.logging.json_format = json;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_key(&self.store.namespace) {
            return Err(ConfigError::Rejected(format!(
                "Invalid namespace: {:?}",
                self.store.namespace
            )));
        }

        if self.store.max_object_size == 0 || self.store.max_total_size == 0 {
            return Err(ConfigError::Rejected(
                "size limits must be greater than 0".to_string(),
            ));
        }

        if self.persistence.schema_version == 0 {
            return Err(ConfigError::Rejected(
                "schema_version starts at 1".to_string(),
            ));
        }

        if let Some(interval) = self.sync.interval {
            if interval.is_zero() {
                return Err(ConfigError::Rejected(
                    "sync interval must be greater than 0".to_string(),
                ));
            }
        }

        if let Some(patterns) = &self.sync.keys {
            for pattern in patterns {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Rejected(format!("Invalid sync key pattern: {}", e))
                })?;
            }
        }

        if self.audit.enabled && self.audit.max_entries == 0 {
            return Err(ConfigError::Rejected(
                "audit max_entries must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Rejected(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }
}
