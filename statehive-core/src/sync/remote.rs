/*
    remote.rs - The remote replica contract

    Two calls make up the protocol:

        POST {endpoint}/versions  {keys}                         -> {versions: {key: {version, timestamp, value}}}
        POST {endpoint}/sync      {key, value, version, timestamp} -> {version, timestamp}

    `HttpRemote` speaks it over HTTP; `MemoryRemote` is an in-process
    replica used by tests and served by the reference harness. A replica
    refuses a push that does not advance its version for the key.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use super::error::{SyncError, SyncResult};

/// The remote's view of one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub version: u64,
    pub timestamp: u64,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionsRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionsResponse {
    pub versions: HashMap<String, RemoteVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub version: u64,
    pub timestamp: u64,
}

#[async_trait]
pub trait SyncRemote: Send + Sync {
    /// Last known version of each key; keys the remote never saw are absent
    async fn fetch_versions(&self, keys: &[String]) -> SyncResult<HashMap<String, RemoteVersion>>;

    async fn push(&self, request: &PushRequest) -> SyncResult<PushAck>;
}

/// JSON over HTTP
pub struct HttpRemote {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRemote {
    pub fn new(endpoint: impl Into<String>) -> SyncResult<Self> {
        Self::with_timeout(endpoint, Duration::from_secs(10))
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(HttpRemote { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<Req: Serialize + ?Sized + Sync, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> SyncResult<Resp> {
        let url = format!("{}/{}", self.endpoint, path);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Status { status: status.as_u16(), message });
        }
        response.json::<Resp>().await.map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl SyncRemote for HttpRemote {
    async fn fetch_versions(&self, keys: &[String]) -> SyncResult<HashMap<String, RemoteVersion>> {
        let request = VersionsRequest { keys: keys.to_vec() };
        let response: VersionsResponse = self.post("versions", &request).await?;
        Ok(response.versions)
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
        self.post("sync", request).await
    }
}

/// In-process replica
#[derive(Debug, Default)]
pub struct MemoryRemote {
    records: Mutex<HashMap<String, RemoteVersion>>,
    offline: AtomicBool,
    failing_pushes: AtomicU32,
    pushes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if another client had pushed it
    pub fn insert(&self, key: &str, version: u64, timestamp: u64, value: Value) {
        self.records.lock().insert(key.to_string(), RemoteVersion { version, timestamp, value });
    }

    pub fn get(&self, key: &str) -> Option<RemoteVersion> {
        self.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Make every call fail with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` pushes with a transport error
    pub fn fail_next_pushes(&self, n: u32) {
        self.failing_pushes.store(n, Ordering::SeqCst);
    }

    /// Push attempts seen, including failed ones
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn versions(&self, keys: &[String]) -> SyncResult<HashMap<String, RemoteVersion>> {
        self.check_online()?;
        let records = self.records.lock();
        Ok(keys
            .iter()
            .filter_map(|key| records.get(key).map(|record| (key.clone(), record.clone())))
            .collect())
    }

    pub fn accept(&self, request: &PushRequest) -> SyncResult<PushAck> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let injected = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::Transport("injected push failure".to_string()));
        }

        let mut records = self.records.lock();
        if let Some(existing) = records.get(&request.key) {
            if existing.version >= request.version {
                return Err(SyncError::Status {
                    status: 409,
                    message: format!(
                        "stale version {} for {} (remote has {})",
                        request.version, request.key, existing.version
                    ),
                });
            }
        }
        records.insert(
            request.key.clone(),
            RemoteVersion { version: request.version, timestamp: request.timestamp, value: request.value.clone() },
        );
        Ok(PushAck { version: request.version, timestamp: request.timestamp })
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::Transport("remote unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SyncRemote for MemoryRemote {
    async fn fetch_versions(&self, keys: &[String]) -> SyncResult<HashMap<String, RemoteVersion>> {
        self.versions(keys)
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
        self.accept(request)
    }
}
