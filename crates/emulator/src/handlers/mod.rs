//! HTTP handlers for the function emulator.
//!
//! - [`runtime`]: worker-facing long-poll protocol
//! - [`invoke`]: ingress catch-all feeding the request broker
//! - [`pool`]: pool introspection and manual redeploy
//! - [`health`]: liveness and summary

pub mod health;
pub mod invoke;
pub mod pool;
pub mod runtime;

pub use health::{api_health, health_check};
pub use invoke::invoke;
