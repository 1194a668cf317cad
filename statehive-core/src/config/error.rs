//! Errors raised while loading or checking a store configuration

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config cannot be encoded: {0}")]
    Encode(#[from] toml::ser::Error),

    /// A single setting or environment override that does not parse.
    #[error("bad setting: {0}")]
    InvalidValue(String),

    /// Settings that parse but contradict each other or the store rules.
    #[error("rejected config: {0}")]
    Rejected(String),
}
