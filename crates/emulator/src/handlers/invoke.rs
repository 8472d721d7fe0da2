//! Ingress: every request not handled by another route invokes the function.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use std::collections::BTreeMap;
use worker_pool::{Invocation, InvocationResponse};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Headers the emulator sets itself on relayed responses.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Admit an ingress request and relay the worker's response.
pub async fn invoke(State(state): State<AppState>, request: Request) -> AppResult<Response> {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let bytes = to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|e| AppError::PayloadTooLarge(e.to_string()))?;

    let mut invocation = Invocation::new(parts.method.as_str(), url).with_body_bytes(&bytes);
    invocation.headers = collect_headers(&parts.headers);

    let response = state.pool.admit(invocation).await?;
    into_http_response(response)
}

/// Flatten a header map; repeated headers are joined with `", "`.
pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            tracing::debug!(header = %name, "Dropping non-text header");
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Turn a worker's response into an HTTP response.
pub fn into_http_response(response: InvocationResponse) -> AppResult<Response> {
    let status = StatusCode::from_u16(response.status)
        .map_err(|_| AppError::BadGateway(format!("invalid status code {}", response.status)))?;
    let body = response
        .body_bytes()
        .map_err(|e| AppError::BadGateway(format!("undecodable body: {e}")))?;

    let mut http = Response::new(Body::from(body));
    *http.status_mut() = status;

    let headers = http.headers_mut();
    for (name, value) in &response.headers {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!(header = %name, "Dropping invalid response header"),
        }
    }

    Ok(http)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_headers_joins_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let collected = collect_headers(&headers);
        assert_eq!(collected["accept"], "text/html, application/json");
        assert_eq!(collected["x-request-id"], "abc");
    }

    #[test]
    fn test_into_http_response() {
        let response = InvocationResponse::text(201, "made")
            .with_header("content-type", "text/plain")
            .with_header("content-length", "999")
            .with_header("bad header", "x");

        let http = into_http_response(response).unwrap();
        assert_eq!(http.status(), StatusCode::CREATED);
        assert_eq!(http.headers()["content-type"], "text/plain");
        assert!(http.headers().get("content-length").is_none());
        assert_eq!(http.headers().len(), 1);
    }

    #[test]
    fn test_invalid_status_is_bad_gateway() {
        let err = into_http_response(InvocationResponse::new(1000)).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
