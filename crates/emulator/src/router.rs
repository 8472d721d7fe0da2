//! Application router.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes.
///
/// Anything that is not a health, runtime or `/api` route is an ingress
/// request for the emulated function.
pub fn build_router(state: AppState) -> Router {
    // CORS only on the introspection API; ingress responses carry the function's own headers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Worker results carry base64 bodies, which are larger than the raw payload
    let runtime_body_limit = state.config.max_body_bytes.saturating_mul(2);

    // Health check routes
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        .with_state(state.clone());

    // Worker long-poll protocol
    let runtime_routes = Router::new()
        .route(
            "/request/{worker_id}",
            get(handlers::runtime::pull_request),
        )
        .route(
            "/response/{worker_id}",
            post(handlers::runtime::push_response),
        )
        .layer(DefaultBodyLimit::max(runtime_body_limit))
        .with_state(state.clone());

    // Pool introspection
    let pool_routes = Router::new()
        .route("/api/pool", get(handlers::pool::snapshot))
        .route("/api/pool/invalidate", post(handlers::pool::invalidate))
        .layer(cors)
        .with_state(state.clone());

    // Ingress catch-all
    let ingress_routes = Router::new()
        .fallback(handlers::invoke)
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(runtime_routes)
        .merge(pool_routes)
        .merge(ingress_routes)
        .layer(TraceLayer::new_for_http())
}
