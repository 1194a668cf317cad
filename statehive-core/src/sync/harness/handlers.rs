//! HTTP API handlers for the reference remote

use super::state::AppState;
use crate::sync::error::SyncError;
use crate::sync::remote::{PushAck, PushRequest, VersionsRequest, VersionsResponse};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error type for API responses
pub struct ApiError(SyncError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            SyncError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// POST /versions - Last known version of each requested key
pub async fn fetch_versions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VersionsRequest>,
) -> ApiResult<Json<VersionsResponse>> {
    let versions = state.remote.versions(&request.keys)?;
    tracing::debug!(requested = request.keys.len(), known = versions.len(), "served versions");
    Ok(Json(VersionsResponse { versions }))
}

/// POST /sync - Accept a pushed value if it advances the key's version
pub async fn push(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PushRequest>,
) -> ApiResult<Json<PushAck>> {
    let ack = state.remote.accept(&request)?;
    tracing::debug!(key = %request.key, version = ack.version, "accepted push");
    Ok(Json(ack))
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
