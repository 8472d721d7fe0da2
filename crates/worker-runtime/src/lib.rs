//! Function emulator worker runtime
//!
//! The process the emulator starts for each worker. It long-polls the
//! emulator's runtime API, runs a handler command for every request and
//! pushes the result back, until the emulator tells it to stop.

pub mod client;
pub mod config;
pub mod executor;
pub mod runtime;

pub use client::{PollResult, RuntimeClient};
pub use config::RuntimeConfig;
pub use executor::HandlerExecutor;
pub use runtime::{Backoff, Runtime};
