//! Launcher that starts nothing.
//!
//! Workers are driven by the embedding code: it calls `pull_work` and
//! `push_result` itself with the ids the pool registered. Used by tests and
//! by embedders that run handlers in-process.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{LaunchSpec, Launcher, WorkerHandle};
use crate::error::LaunchError;
use crate::version::CodeVersion;
use crate::worker::WorkerId;

#[derive(Debug, Default)]
pub struct ManualLauncher {
    launches: AtomicUsize,
    fail_launches: AtomicBool,
    launch_delay: Mutex<Option<Duration>>,
    stopped: Mutex<Vec<WorkerId>>,
    dead: Mutex<HashSet<WorkerId>>,
    versions: Mutex<Vec<CodeVersion>>,
}

impl ManualLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent launches fail (or succeed again).
    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Delay every launch, emulating slow startup.
    pub fn set_launch_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.launch_delay.lock() {
            *guard = delay;
        }
    }

    /// Mark a worker as crashed; `is_running` reports false from now on.
    pub fn kill(&self, worker_id: WorkerId) {
        if let Ok(mut dead) = self.dead.lock() {
            dead.insert(worker_id);
        }
    }

    /// Successful launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Workers stopped so far, in order.
    pub fn stopped(&self) -> Vec<WorkerId> {
        self.stopped.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Code versions requested by each successful launch, in order.
    pub fn launched_versions(&self) -> Vec<CodeVersion> {
        self.versions.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for ManualLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<WorkerHandle, LaunchError> {
        let delay = self.launch_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(LaunchError::Spawn("launches disabled".to_string()));
        }

        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut versions) = self.versions.lock() {
            versions.push(spec.code_version);
        }

        Ok(WorkerHandle {
            worker_id: spec.worker_id,
            pid: None,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) {
        if let Ok(mut stopped) = self.stopped.lock() {
            stopped.push(handle.worker_id);
        }
    }

    async fn is_running(&self, handle: &WorkerHandle) -> bool {
        self.dead
            .lock()
            .map(|dead| !dead.contains(&handle.worker_id))
            .unwrap_or(true)
    }
}
