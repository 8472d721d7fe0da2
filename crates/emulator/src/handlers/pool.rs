//! Pool introspection and manual redeploy.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use worker_pool::{CodeVersion, PoolSnapshot};

use crate::state::AppState;

/// Response of a manual invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub status: String,
    pub code_version: CodeVersion,
}

/// Current pool state.
///
/// `GET /api/pool`
pub async fn snapshot(State(state): State<AppState>) -> Json<PoolSnapshot> {
    Json(state.pool.snapshot().await)
}

/// Publish a new code version and replace every worker.
///
/// `POST /api/pool/invalidate`
pub async fn invalidate(State(state): State<AppState>) -> Json<InvalidateResponse> {
    let code_version = state.pool.invalidate_all().await;
    tracing::info!(code_version = %code_version, "Manual redeploy requested");
    Json(InvalidateResponse {
        status: "ok".to_string(),
        code_version,
    })
}
