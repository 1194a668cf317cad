//! HTTP server for the reference remote

use super::handlers::{fetch_versions, health, push};
use super::state::AppState;
use crate::sync::remote::MemoryRemote;
use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// `POST /versions` and `POST /sync` mirror `SyncRemote`.
fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/versions", post(fetch_versions))
        .route("/sync", post(push))
        .with_state(state)
}

pub struct HarnessServer {
    state: Arc<AppState>,
    listener: TcpListener,
}

impl HarnessServer {
    /// Bind `addr`; port 0 picks an ephemeral port
    pub async fn bind(remote: Arc<MemoryRemote>, addr: impl AsRef<str>) -> Result<Self> {
        let listener = TcpListener::bind(addr.as_ref()).await?;
        Ok(Self { state: Arc::new(AppState::new(remote)), listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn remote(&self) -> Arc<MemoryRemote> {
        self.state.remote.clone()
    }

    /// Serve until the task is dropped
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let router = routes(self.state);
        info!("sync harness listening on {}", addr);
        axum::serve(self.listener, router).await?;
        Ok(())
    }
}

/// Serve an empty replica on `addr`
pub async fn start_server(addr: impl AsRef<str>) -> Result<()> {
    HarnessServer::bind(Arc::new(MemoryRemote::new()), addr).await?.run().await
}
