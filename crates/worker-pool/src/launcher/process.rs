//! Local child-process launcher.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{LaunchSpec, Launcher, WorkerHandle};
use crate::error::LaunchError;
use crate::worker::WorkerId;

/// Starts one child process per worker.
///
/// Each child receives `WORKER_ID`, `CODE_VERSION` and `RUNTIME_API` in its
/// environment and is expected to long-poll `RUNTIME_API` with them. A child
/// counts as ready once it has survived `startup_grace`.
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    runtime_api: String,
    startup_grace: Duration,
    stop_timeout: Duration,
    children: Mutex<HashMap<WorkerId, Child>>,
}

impl ProcessLauncher {
    /// Create a launcher running `program` against the given runtime API URL.
    pub fn new(program: impl Into<String>, runtime_api: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            runtime_api: runtime_api.into(),
            startup_grace: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Number of children currently tracked.
    pub async fn running_children(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, LaunchError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .envs(&spec.env)
            .env("WORKER_ID", spec.worker_id.to_string())
            .env("CODE_VERSION", spec.code_version.to_string())
            .env("RUNTIME_API", &self.runtime_api)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{}: {}", self.program, e)))?;

        tokio::time::sleep(self.startup_grace).await;

        match child.try_wait() {
            Ok(Some(status)) => return Err(LaunchError::ExitedEarly(status.to_string())),
            Ok(None) => {}
            Err(e) => return Err(LaunchError::Spawn(format!("failed to poll child: {}", e))),
        }

        let pid = child.id();
        self.children.lock().await.insert(spec.worker_id, child);

        tracing::debug!(
            worker_id = %spec.worker_id,
            code_version = %spec.code_version,
            pid = ?pid,
            "Worker process started"
        );

        Ok(WorkerHandle {
            worker_id: spec.worker_id,
            pid,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) {
        let child = self.children.lock().await.remove(&handle.worker_id);
        let Some(mut child) = child else {
            return;
        };

        if let Err(e) = child.start_kill() {
            // Already exited on its own; reap below.
            tracing::trace!(worker_id = %handle.worker_id, error = %e, "Kill skipped");
        }

        match timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(worker_id = %handle.worker_id, %status, "Worker process stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(worker_id = %handle.worker_id, error = %e, "Failed to reap worker process");
            }
            Err(_) => {
                tracing::warn!(
                    worker_id = %handle.worker_id,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Worker process did not exit in time"
                );
            }
        }
    }

    async fn is_running(&self, handle: &WorkerHandle) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&handle.worker_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
