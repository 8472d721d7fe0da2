//! Pool manager: worker lifecycle, sizing, health checks and invalidation.
//!
//! All pool and queue mutations happen under one lock. Launcher calls run
//! outside it and only take the lock to register or remove a worker, so a slow
//! launch never blocks unrelated admissions.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{LaunchError, PoolError};
use crate::launcher::{LaunchSpec, Launcher, WorkerHandle};
use crate::queue::{AdmissionQueue, PendingRequest};
use crate::version::{CodeVersion, VersionTracker};
use crate::worker::{Wake, Worker, WorkerId, WorkerInfo, WorkerState};

/// Worker pool and request broker.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub config: PoolConfig,
    pub launcher: Arc<dyn Launcher>,
    pub versions: VersionTracker,
    pub state: Mutex<PoolState>,
    pub poll_tokens: AtomicU64,
    /// Signalled whenever a launch in flight registers its worker or gives up.
    pub registrations: Notify,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Everything guarded by the broker lock.
#[derive(Default)]
pub(crate) struct PoolState {
    pub workers: HashMap<WorkerId, Worker>,
    pub queue: AdmissionQueue,
    /// Slots reserved by launches still in flight.
    pub launching: usize,
    /// Ids handed to the launcher and not yet registered. A worker may poll
    /// before its launch returns.
    pub starting: HashSet<WorkerId>,
    pub closed: bool,
}

impl PoolState {
    /// Workers counting toward `max_size`: live non-retired workers plus launches in flight.
    pub fn active_count(&self) -> usize {
        self.live_count() + self.launching
    }

    /// Registered workers that are not retired.
    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|w| !w.is_unhealthy()).count()
    }

    /// Reserve a launch slot if the pool has room.
    pub fn try_reserve(&mut self, max_size: usize) -> bool {
        if self.closed || self.active_count() >= max_size {
            return false;
        }
        self.launching += 1;
        true
    }

    pub fn release_reservation(&mut self) {
        self.launching = self.launching.saturating_sub(1);
    }

    /// Most recently used idle worker on `version`, so older ones age out first.
    pub fn pick_idle(&self, version: CodeVersion) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.is_idle() && w.code_version == version)
            .max_by_key(|w| w.last_used_at)
            .map(|w| w.id)
    }

    pub fn bind(&mut self, worker_id: WorkerId, request: PendingRequest) {
        match self.workers.get_mut(&worker_id) {
            Some(worker) => worker.bind(request),
            None => self.queue.push_back(request),
        }
    }

    /// Bind the next queued request to `worker_id` if it is idle.
    pub fn drain_into(&mut self, worker_id: WorkerId) -> bool {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if !worker.is_idle() {
            return false;
        }
        let Some(request) = self.queue.pop_next() else {
            return false;
        };
        worker.bind(request);
        true
    }

    /// Bind queued requests to any idle workers on `version`.
    pub fn dispatch_queued(&mut self, version: CodeVersion) {
        while !self.queue.is_empty() {
            let Some(worker_id) = self.pick_idle(version) else {
                break;
            };
            if !self.drain_into(worker_id) {
                break;
            }
        }
    }

    pub fn detach(&mut self, worker_id: WorkerId) -> Option<Worker> {
        self.workers.remove(&worker_id)
    }
}

/// What one health-check pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Idle workers evicted past the idle timeout.
    pub evicted: usize,
    /// Workers whose process was found dead.
    pub dead: usize,
    /// Queue entries dropped (abandoned or overdue).
    pub expired: usize,
    /// Workers started to restore `min_size` or to serve queued requests.
    pub replenished: usize,
}

impl HealthReport {
    pub fn is_quiet(&self) -> bool {
        *self == HealthReport::default()
    }
}

/// Serializable view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub code_version: CodeVersion,
    pub min_size: usize,
    pub max_size: usize,
    pub workers: Vec<WorkerInfo>,
    pub queued: usize,
    pub launching: usize,
    pub closed: bool,
}

impl PoolSnapshot {
    /// Workers that are not retired.
    pub fn size(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state != WorkerState::Unhealthy)
            .count()
    }

    pub fn idle(&self) -> usize {
        self.count_state(WorkerState::Idle)
    }

    pub fn busy(&self) -> usize {
        self.count_state(WorkerState::Busy)
    }

    pub fn unhealthy(&self) -> usize {
        self.count_state(WorkerState::Unhealthy)
    }

    /// Workers holding a request, whatever their state.
    pub fn bound(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.pending_request_id.is_some())
            .count()
    }

    fn count_state(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }
}

impl WorkerPool {
    /// Create a pool. No worker is started until [`WorkerPool::start`].
    pub fn new(config: PoolConfig, launcher: Arc<dyn Launcher>) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                launcher,
                versions: VersionTracker::new(),
                state: Mutex::new(PoolState::default()),
                poll_tokens: AtomicU64::new(1),
                registrations: Notify::new(),
                health_task: std::sync::Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn current_version(&self) -> CodeVersion {
        self.inner.versions.current()
    }

    pub fn subscribe_versions(&self) -> watch::Receiver<CodeVersion> {
        self.inner.versions.subscribe()
    }

    /// Start `min_size` workers and the health-check loop.
    pub async fn start(&self) -> Result<(), PoolError> {
        for _ in 0..self.inner.config.min_size {
            if !self.reserve().await {
                break;
            }
            self.launch_reserved(None).await?;
        }

        let handle = self.spawn_health_check();
        if let Ok(mut task) = self.inner.health_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }

        tracing::info!(
            min_size = self.inner.config.min_size,
            max_size = self.inner.config.max_size,
            code_version = %self.current_version(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Start one worker on the current code version, if the pool has room.
    pub async fn create_worker(&self) -> Result<WorkerId, PoolError> {
        if !self.reserve().await {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(PoolError::ShuttingDown);
            }
            return Err(PoolError::LaunchFailed(format!(
                "pool is at max_size ({})",
                self.inner.config.max_size
            )));
        }
        self.launch_reserved(None).await
    }

    /// Remove a worker. A request it holds fails with `WorkerTerminated`.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> bool {
        let removed = self.inner.state.lock().await.detach(worker_id);
        match removed {
            Some(mut worker) => {
                worker.retire();
                tracing::info!(worker_id = %worker_id, "Removing worker");
                self.dispose(vec![worker], PoolError::WorkerTerminated).await;
                self.backfill().await;
                true
            }
            None => false,
        }
    }

    /// Retire every worker on an older code version.
    ///
    /// Publishes the next version, marks current workers `Unhealthy`, starts
    /// replacements up to the prior pool size and removes the old workers that
    /// hold nothing. Old workers still executing a request finish it and are
    /// removed when they push the result.
    pub async fn invalidate_all(&self) -> CodeVersion {
        let (version, target, requeued) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return self.inner.versions.current();
            }

            let prior = state.live_count();
            let version = self.inner.versions.advance();

            let mut requeued = Vec::new();
            for worker in state.workers.values_mut() {
                if worker.code_version == version || worker.is_unhealthy() {
                    continue;
                }
                worker.retire();
                if let Some(request) = worker.unbind_undelivered() {
                    requeued.push(request);
                }
                if !worker.is_bound() {
                    worker.wake(Wake::Retired);
                }
            }
            let requeued_count = requeued.len();
            state.queue.requeue_front(requeued);
            state.dispatch_queued(version);

            let target = prior
                .max(self.inner.config.min_size)
                .min(self.inner.config.max_size);
            (version, target, requeued_count)
        };

        tracing::info!(
            code_version = %version,
            replacements = target,
            requeued,
            "Code version advanced; replacing workers"
        );

        let reserved = {
            let mut state = self.inner.state.lock().await;
            let room = target.saturating_sub(state.active_count());
            state.launching += room;
            room
        };
        let results = join_all((0..reserved).map(|_| self.launch_reserved(None))).await;
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!(error = %err, "Failed to start replacement worker");
        }

        let stale: Vec<Worker> = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<WorkerId> = state
                .workers
                .values()
                .filter(|w| w.is_unhealthy() && !w.is_bound())
                .map(|w| w.id)
                .collect();
            ids.into_iter().filter_map(|id| state.detach(id)).collect()
        };
        self.dispose(stale, PoolError::WorkerTerminated).await;

        version
    }

    /// Run one health-check pass.
    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        let handles: Vec<WorkerHandle> = {
            let state = self.inner.state.lock().await;
            if state.closed {
                return report;
            }
            state.workers.values().map(|w| w.handle.clone()).collect()
        };

        let mut dead = Vec::new();
        for handle in &handles {
            if !self.inner.launcher.is_running(handle).await {
                dead.push(handle.worker_id);
            }
        }

        let (crashed, evicted) = {
            let mut state = self.inner.state.lock().await;
            let crashed: Vec<Worker> = dead.iter().filter_map(|id| state.detach(*id)).collect();

            let now = Instant::now();
            report.expired = state.queue.purge(now);

            let idle_timeout = self.inner.config.idle_timeout;
            let mut candidates: Vec<(Instant, WorkerId)> = state
                .workers
                .values()
                .filter(|w| w.is_idle() && now.saturating_duration_since(w.last_used_at) > idle_timeout)
                .map(|w| (w.last_used_at, w.id))
                .collect();
            candidates.sort();

            let mut size = state.live_count();
            let mut evicted = Vec::new();
            for (_, worker_id) in candidates {
                if size <= self.inner.config.min_size {
                    break;
                }
                if let Some(mut worker) = state.detach(worker_id) {
                    worker.retire();
                    evicted.push(worker);
                    size -= 1;
                }
            }
            (crashed, evicted)
        };

        for worker in &crashed {
            tracing::warn!(worker_id = %worker.id, "Worker is no longer running; removing it");
        }
        for worker in &evicted {
            tracing::info!(
                worker_id = %worker.id,
                request_count = worker.request_count,
                "Evicting idle worker"
            );
        }
        report.dead = crashed.len();
        report.evicted = evicted.len();
        self.dispose(crashed, PoolError::WorkerTerminated).await;
        self.dispose(evicted, PoolError::WorkerTerminated).await;

        report.replenished = self.replenish().await + self.backfill().await;
        report
    }

    /// Stop accepting work, reject everything pending and stop all workers.
    pub async fn shutdown(&self) {
        if let Ok(mut task) = self.inner.health_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }

        let (workers, queued) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let workers: Vec<Worker> = state.workers.drain().map(|(_, w)| w).collect();
            (workers, state.queue.drain_all())
        };

        tracing::info!(
            workers = workers.len(),
            queued = queued.len(),
            "Shutting down worker pool"
        );

        for request in queued {
            request.resolve(Err(PoolError::ShuttingDown));
        }
        self.dispose(workers, PoolError::ShuttingDown).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let mut workers: Vec<WorkerInfo> = state.workers.values().map(|w| w.info(now)).collect();
        workers.sort_by_key(|w| w.started_at);
        PoolSnapshot {
            code_version: self.inner.versions.current(),
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
            workers,
            queued: state.queue.len(),
            launching: state.launching,
            closed: state.closed,
        }
    }

    async fn reserve(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .try_reserve(self.inner.config.max_size)
    }

    /// Start workers until the pool is back at `min_size`.
    async fn replenish(&self) -> usize {
        let mut created = 0;
        loop {
            {
                let mut state = self.inner.state.lock().await;
                if state.closed || state.active_count() >= self.inner.config.min_size {
                    break;
                }
                state.launching += 1;
            }
            match self.launch_reserved(None).await {
                Ok(_) => created += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to restore minimum pool size");
                    break;
                }
            }
        }
        created
    }

    /// Start workers for queued requests, as far as `max_size` allows.
    ///
    /// Needed after a removal frees a slot: otherwise the queue only moves
    /// when a busy worker pushes its result.
    pub(crate) async fn backfill(&self) -> usize {
        let reserved = {
            let mut state = self.inner.state.lock().await;
            let wanted = state.queue.len();
            let mut reserved = 0;
            while reserved < wanted && state.try_reserve(self.inner.config.max_size) {
                reserved += 1;
            }
            reserved
        };
        if reserved == 0 {
            return 0;
        }

        tracing::debug!(reserved, "Starting workers for queued requests");
        let results = join_all((0..reserved).map(|_| self.launch_reserved(None))).await;
        let mut started = 0;
        for result in results {
            match result {
                Ok(_) => started += 1,
                Err(e) => tracing::warn!(error = %e, "Failed to start worker for queued request"),
            }
        }
        started
    }

    /// Launch a worker for an already reserved slot and register it.
    ///
    /// Runs on its own task so a caller dropping its future cannot leak the
    /// reservation or orphan a started worker. With `request`, the new worker
    /// is bound to it; otherwise it takes the head of the queue.
    pub(crate) async fn launch_reserved(
        &self,
        request: Option<PendingRequest>,
    ) -> Result<WorkerId, PoolError> {
        let pool = self.clone();
        match tokio::spawn(async move { pool.launch_and_register(request).await }).await {
            Ok(result) => result,
            Err(e) => Err(LaunchError::Fault(e.to_string()).into()),
        }
    }

    async fn launch_and_register(
        &self,
        mut request: Option<PendingRequest>,
    ) -> Result<WorkerId, PoolError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let code_version = self.inner.versions.current();
            let spec = LaunchSpec {
                worker_id: Uuid::new_v4(),
                code_version,
                env: self.inner.config.worker_env.clone(),
            };
            let worker_id = spec.worker_id;
            self.inner.state.lock().await.starting.insert(worker_id);

            let handle = match self.launch_one(spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    let mut state = self.inner.state.lock().await;
                    self.launch_settled(&mut state, worker_id);
                    // A worker started on a version that moved on may exit on its own.
                    let churned = !self.inner.versions.is_current(code_version);
                    if churned && !state.closed && attempts < self.inner.config.launch_attempts {
                        drop(state);
                        tracing::info!(
                            worker_id = %worker_id,
                            code_version = %code_version,
                            attempts,
                            error = %e,
                            "Launch on a superseded version failed; retrying"
                        );
                        continue;
                    }
                    state.release_reservation();
                    drop(state);
                    tracing::warn!(
                        worker_id = %worker_id,
                        code_version = %code_version,
                        error = %e,
                        "Worker launch failed"
                    );
                    return Err(e.into());
                }
            };

            let mut state = self.inner.state.lock().await;
            self.launch_settled(&mut state, worker_id);
            if state.closed {
                state.release_reservation();
                drop(state);
                self.inner.launcher.stop(&handle).await;
                return Err(PoolError::ShuttingDown);
            }

            if !self.inner.versions.is_current(code_version) {
                let give_up = attempts >= self.inner.config.launch_attempts;
                if give_up {
                    state.release_reservation();
                }
                drop(state);
                self.inner.launcher.stop(&handle).await;
                tracing::info!(
                    worker_id = %worker_id,
                    code_version = %code_version,
                    attempts,
                    "Code version moved during launch; discarding worker"
                );
                if give_up {
                    return Err(LaunchError::VersionChurn(attempts).into());
                }
                continue;
            }

            state.release_reservation();
            state.workers.insert(worker_id, Worker::new(handle, code_version));
            match request.take() {
                Some(request) if !request.is_abandoned() => state.bind(worker_id, request),
                _ => {
                    state.drain_into(worker_id);
                }
            }

            tracing::info!(
                worker_id = %worker_id,
                code_version = %code_version,
                pool_size = state.workers.len(),
                "Worker registered"
            );
            return Ok(worker_id);
        }
    }

    fn launch_settled(&self, state: &mut PoolState, worker_id: WorkerId) {
        state.starting.remove(&worker_id);
        self.inner.registrations.notify_waiters();
    }

    /// Call the launcher on its own task so a panicking launcher becomes a `LaunchFailed`.
    async fn launch_one(&self, spec: LaunchSpec) -> Result<WorkerHandle, LaunchError> {
        let launcher = Arc::clone(&self.inner.launcher);
        match tokio::spawn(async move { launcher.launch(spec).await }).await {
            Ok(result) => result,
            Err(e) => Err(LaunchError::Fault(e.to_string())),
        }
    }

    /// Terminate removed workers: fail what they hold, then stop them.
    pub(crate) async fn dispose(&self, workers: Vec<Worker>, reason: PoolError) {
        if workers.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let worker_id = worker.id;
            let (handle, request) = worker.terminate();
            if let Some(request) = request {
                tracing::warn!(
                    worker_id = %worker_id,
                    request_id = %request.id,
                    reason = %reason,
                    "Failing request held by removed worker"
                );
                request.resolve(Err(reason.clone()));
            }
            handles.push(handle);
        }

        join_all(handles.iter().map(|h| self.inner.launcher.stop(h))).await;
    }

    fn spawn_health_check(&self) -> JoinHandle<()> {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;

                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let report = WorkerPool { inner }.health_check().await;
                if !report.is_quiet() {
                    tracing::debug!(
                        evicted = report.evicted,
                        dead = report.dead,
                        expired = report.expired,
                        replenished = report.replenished,
                        "Health check"
                    );
                }
            }
        })
    }
}
