//! Worker launcher seam.
//!
//! The pool never starts processes itself. It asks a [`Launcher`] for a
//! worker bound to a code version and treats the returned handle as ready.

mod manual;
mod process;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::LaunchError;
use crate::version::CodeVersion;
use crate::worker::WorkerId;

pub use manual::ManualLauncher;
pub use process::ProcessLauncher;

/// What to start.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Identifier the worker must present when polling.
    pub worker_id: WorkerId,

    /// Code version the worker runs and presents when polling.
    pub code_version: CodeVersion,

    /// Extra environment for the worker.
    pub env: HashMap<String, String>,
}

/// A started worker, as reported by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,

    /// OS process id, when the launcher runs real processes.
    pub pid: Option<u32>,
}

/// Starts and stops isolated workers.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a worker and return once it is ready to poll.
    async fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, LaunchError>;

    /// Stop a worker and reclaim its resources. Failures are logged, not returned.
    async fn stop(&self, handle: &WorkerHandle);

    /// Whether the worker is still alive.
    async fn is_running(&self, _handle: &WorkerHandle) -> bool {
        true
    }
}
