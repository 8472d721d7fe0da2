//! Worker-facing runtime API.
//!
//! Workers long-poll `GET /request/{worker_id}?version=N` for their next
//! invocation and answer with `POST /response/{worker_id}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use worker_pool::{CodeVersion, InvocationResponse, PollOutcome, PushOutcome, WorkerId};

use crate::state::AppState;

/// Query parameters of a poll.
#[derive(Debug, Clone, Deserialize)]
pub struct PullQuery {
    /// Code version the worker was started with
    pub version: CodeVersion,
}

/// Body of every non-`200` poll answer and of push acknowledgements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatusResponse {
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_version: Option<CodeVersion>,
}

impl RuntimeStatusResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            code_version: None,
        }
    }
}

/// Long-poll for work.
///
/// `GET /request/{worker_id}?version=N`
///
/// - `200 OK` with the invocation
/// - `404 Not Found` when the poll timed out; poll again
/// - `409 Conflict` when a newer poll from the same worker replaced this one
/// - `410 Gone` on a version mismatch or for a worker the pool no longer
///   knows; the worker must stop
pub async fn pull_request(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
    Query(query): Query<PullQuery>,
) -> Response {
    match state.pool.pull_work(worker_id, query.version).await {
        PollOutcome::Work(invocation) => (StatusCode::OK, Json(invocation)).into_response(),
        PollOutcome::NoWork => (
            StatusCode::NOT_FOUND,
            Json(RuntimeStatusResponse::new("no_work")),
        )
            .into_response(),
        PollOutcome::VersionMismatch => (
            StatusCode::GONE,
            Json(RuntimeStatusResponse {
                code_version: Some(state.pool.current_version()),
                ..RuntimeStatusResponse::new("version_mismatch")
            }),
        )
            .into_response(),
        PollOutcome::Retired => (
            StatusCode::GONE,
            Json(RuntimeStatusResponse::new("retired")),
        )
            .into_response(),
        PollOutcome::Superseded => (
            StatusCode::CONFLICT,
            Json(RuntimeStatusResponse::new("superseded")),
        )
            .into_response(),
    }
}

/// Deliver a worker's result.
///
/// `POST /response/{worker_id}`
///
/// Always `200 OK`; a push with nothing bound is acknowledged as `ignored`.
pub async fn push_response(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
    Json(response): Json<InvocationResponse>,
) -> Json<RuntimeStatusResponse> {
    let status = match state.pool.push_result(worker_id, response).await {
        PushOutcome::Completed => "ok",
        PushOutcome::Ignored => "ignored",
    };
    Json(RuntimeStatusResponse::new(status))
}
