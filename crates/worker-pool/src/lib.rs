//! Function emulator worker pool
//!
//! Manages a dynamically sized set of worker processes standing in for a
//! function runtime, and brokers ingress requests to them over a pull-based
//! long-poll protocol.
//!
//! This crate provides:
//! - Pool manager with min/max sizing, idle eviction and health checks
//! - Request broker (admit, pull work, push result)
//! - FIFO admission queue with per-request deadlines
//! - Code version tracking and cooperative invalidation
//! - Launcher seam with a local child-process implementation
//! - Build watcher that publishes a new code version on change

mod broker;
pub mod config;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod version;
pub mod watcher;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::PoolConfig;
pub use error::{LaunchError, PoolError};
pub use launcher::{LaunchSpec, Launcher, ManualLauncher, ProcessLauncher, WorkerHandle};
pub use pool::{HealthReport, PoolSnapshot, WorkerPool};
pub use protocol::{Invocation, InvocationResponse, PollOutcome, PushOutcome};
pub use queue::RequestId;
pub use version::{CodeVersion, VersionTracker};
pub use watcher::{BuildWatcher, Fingerprint};
pub use worker::{WorkerId, WorkerInfo, WorkerState};
