//! Error types for the function emulator server.
//!
//! `AppError` implements `IntoResponse`, so handlers return it directly and
//! pool failures reach the ingress caller as a JSON error with a fitting
//! status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use worker_pool::PoolError;

/// Application-level errors for the emulator.
#[derive(Error, Debug)]
pub enum AppError {
    /// Worker pool error
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Bad request error
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request body over the configured limit
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// A worker answered with something that cannot be relayed
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Pool(e) => match e {
                PoolError::AdmissionTimeout | PoolError::ResponseTimeout => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                PoolError::WorkerTerminated => StatusCode::BAD_GATEWAY,
                PoolError::LaunchFailed(_) | PoolError::ShuttingDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PoolError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) | AppError::Config(_) | AppError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            AppError::Pool(e) if e.is_retryable() => {
                tracing::warn!(error = %e, retryable = true, "Request failed in worker pool");
            }
            AppError::Pool(e) => {
                tracing::error!(error = %e, "Worker pool error");
            }
            AppError::BadGateway(msg) => {
                tracing::warn!(error = %msg, "Unusable worker response");
            }
            AppError::Internal(msg) | AppError::Config(msg) => {
                tracing::error!(error = %msg, "Internal error");
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
            }
            AppError::BadRequest(_) | AppError::PayloadTooLarge(_) => {}
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
