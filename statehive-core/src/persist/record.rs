//! Persisted record format
//!
//! `{"v": version, "t": timestamp, "e": expiry|null, "d": payload, "_sys_v": schema}`
//! plus `"_enc": true` / `"_b64": true` when the payload went through a transform.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_schema_version() -> u32 {
    1
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Entry version
    pub v: u64,
    /// Commit time, epoch millis
    pub t: u64,
    /// Expiry, epoch millis
    pub e: Option<u64>,
    /// The value, or the transform's string payload
    pub d: Value,
    #[serde(rename = "_sys_v", default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(rename = "_enc", default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    #[serde(rename = "_b64", default, skip_serializing_if = "is_false")]
    pub base64: bool,
}

impl StorageRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.e.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_transformed(&self) -> bool {
        self.encrypted || self.base64
    }
}
