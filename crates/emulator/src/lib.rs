//! Local function emulator
//!
//! HTTP front end of the worker pool:
//!
//! - **Ingress**: any request outside the routes below is admitted to the
//!   pool and answered with the worker's response
//! - **Runtime API**: `GET /request/{worker_id}` and `POST /response/{worker_id}`,
//!   the long-poll protocol workers speak
//! - **Introspection**: `/health`, `/api/health`, `/api/pool` and
//!   `POST /api/pool/invalidate`
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`error`]: Error type with Axum integration
//! - [`handlers`]: HTTP route handlers
//! - [`router`]: Route table
//! - [`state`]: Shared application state

pub mod config;
pub mod error;
pub mod handlers;
pub mod result_ext;
pub mod router;
pub mod state;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
pub use router::build_router;
