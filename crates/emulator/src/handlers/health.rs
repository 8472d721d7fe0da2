//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use worker_pool::CodeVersion;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Health status ("ok" or "unhealthy")
    pub status: String,
}

/// Detailed health check response for the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    /// Overall health status
    pub status: String,

    /// Server name
    pub server_name: String,

    /// Current code version
    pub code_version: CodeVersion,

    /// Live (non-retired) workers
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Server version
    pub version: String,
}

/// Basic health check endpoint.
///
/// `GET /health`
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// Pool summary.
///
/// `GET /api/health`
///
/// - `200 OK` while the pool accepts work
/// - `503 Service Unavailable` once it is shutting down
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let snapshot = state.pool.snapshot().await;

    let (status, status_code) = if snapshot.closed {
        ("shutting_down", StatusCode::SERVICE_UNAVAILABLE)
    } else {
        ("ok", StatusCode::OK)
    };

    let response = ApiHealthResponse {
        status: status.to_string(),
        server_name: state.config.server_name.clone(),
        code_version: snapshot.code_version,
        workers: snapshot.size(),
        idle: snapshot.idle(),
        busy: snapshot.busy(),
        queued: snapshot.queued,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
