//! Request broker: long-poll correlation between ingress callers and workers.
//!
//! Workers always initiate. A worker parks in [`WorkerPool::pull_work`] until
//! a request is bound to it, and answers with [`WorkerPool::push_result`].
//! Ingress callers go through [`WorkerPool::admit`], which resolves once the
//! bound worker pushes its result.

use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::RecvError;
use tokio::time::Instant;

use crate::error::PoolError;
use crate::pool::WorkerPool;
use crate::protocol::{Invocation, InvocationResponse, PollOutcome, PushOutcome};
use crate::queue::{PendingRequest, ReplyReceiver, RequestId};
use crate::version::CodeVersion;
use crate::worker::{PollWaiter, Wake, WorkerId};

/// Where an admitted request ended up.
enum Placement {
    Bound,
    Queued,
}

/// What the response deadline found when it fired.
enum Abandoned {
    /// Still queued; removed.
    Queued,
    /// Bound to a worker that never answered; the worker was removed.
    Bound,
    /// Already resolved by someone else.
    Settled,
}

impl WorkerPool {
    /// Admit an ingress request and wait for a worker's response.
    pub async fn admit(&self, payload: Invocation) -> Result<InvocationResponse, PoolError> {
        let (request, mut reply) = PendingRequest::new(payload, self.inner.config.queue_timeout);
        let request_id = request.id;
        let deadline = request.deadline;

        tracing::debug!(
            request_id = %request_id,
            method = %request.payload.method,
            url = %request.payload.url,
            "Admitting request"
        );

        if let Placement::Queued = self.place(request).await? {
            tokio::select! {
                result = &mut reply => return settle(result),
                _ = tokio::time::sleep_until(deadline) => {
                    if self.expire_queued(request_id).await {
                        tracing::warn!(request_id = %request_id, "Request expired in admission queue");
                        return Err(PoolError::AdmissionTimeout);
                    }
                }
            }
        }

        self.await_response(request_id, reply).await
    }

    /// Bind to an idle worker, start a new one, or queue.
    async fn place(&self, request: PendingRequest) -> Result<Placement, PoolError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(PoolError::ShuttingDown);
            }

            let version = self.inner.versions.current();
            if let Some(worker_id) = state.pick_idle(version) {
                state.bind(worker_id, request);
                return Ok(Placement::Bound);
            }

            if !state.try_reserve(self.inner.config.max_size) {
                tracing::debug!(
                    request_id = %request.id,
                    queued = state.queue.len() + 1,
                    "Pool saturated; queueing request"
                );
                state.queue.push_back(request);
                return Ok(Placement::Queued);
            }
        }

        self.launch_reserved(Some(request)).await?;
        Ok(Placement::Bound)
    }

    /// Remove a request from the queue once its deadline passed.
    ///
    /// False when it was bound in the meantime; the caller then waits for the
    /// worker like any bound request.
    async fn expire_queued(&self, request_id: RequestId) -> bool {
        self.inner
            .state
            .lock()
            .await
            .queue
            .remove(request_id)
            .is_some()
    }

    async fn await_response(
        &self,
        request_id: RequestId,
        mut reply: ReplyReceiver,
    ) -> Result<InvocationResponse, PoolError> {
        let Some(limit) = self.inner.config.response_timeout else {
            return settle(reply.await);
        };

        tokio::select! {
            result = &mut reply => settle(result),
            _ = tokio::time::sleep(limit) => match self.abandon(request_id).await {
                Abandoned::Bound => Err(PoolError::ResponseTimeout),
                Abandoned::Queued => Err(PoolError::AdmissionTimeout),
                Abandoned::Settled => settle(reply.await),
            },
        }
    }

    /// Give up on a request whose worker did not answer in time.
    async fn abandon(&self, request_id: RequestId) -> Abandoned {
        let stuck = {
            let mut state = self.inner.state.lock().await;
            if state.queue.remove(request_id).is_some() {
                return Abandoned::Queued;
            }

            let holder = state
                .workers
                .values()
                .find(|w| w.pending_request_id() == Some(request_id))
                .map(|w| w.id);
            let Some(mut worker) = holder.and_then(|id| state.detach(id)) else {
                return Abandoned::Settled;
            };
            // The caller reports the timeout itself.
            worker.unbind();
            worker.retire();
            worker
        };

        tracing::warn!(
            worker_id = %stuck.id,
            request_id = %request_id,
            "Worker did not answer in time; removing it"
        );
        self.dispose(vec![stuck], PoolError::ResponseTimeout).await;
        // The caller is waiting on this timeout; queued requests get their worker in the background.
        let pool = self.clone();
        tokio::spawn(async move {
            pool.backfill().await;
        });
        Abandoned::Bound
    }

    /// Long-poll for the next request bound to `worker_id`.
    pub async fn pull_work(&self, worker_id: WorkerId, presented: CodeVersion) -> PollOutcome {
        let poll_deadline = Instant::now() + self.inner.config.pull_timeout;
        let (token, mut wake) = loop {
            let mut state = self.inner.state.lock().await;

            let current = self.inner.versions.current();
            if presented != current {
                let unbound = state
                    .workers
                    .get(&worker_id)
                    .is_some_and(|w| !w.is_bound());
                let stale = if unbound { state.detach(worker_id) } else { None };
                drop(state);

                tracing::info!(
                    worker_id = %worker_id,
                    presented = %presented,
                    current = %current,
                    "Rejecting poll from stale worker"
                );
                if let Some(worker) = stale {
                    self.dispose(vec![worker], PoolError::WorkerTerminated).await;
                }
                return PollOutcome::VersionMismatch;
            }

            if !state.workers.contains_key(&worker_id) {
                if !state.starting.contains(&worker_id) {
                    tracing::debug!(worker_id = %worker_id, "Poll from unknown worker");
                    return PollOutcome::Retired;
                }
                // Polled before its launch returned; wait for registration.
                // Created under the lock so a registration in between is not missed.
                let registered = self.inner.registrations.notified();
                drop(state);
                tokio::select! {
                    _ = registered => continue,
                    _ = tokio::time::sleep_until(poll_deadline) => return PollOutcome::NoWork,
                }
            }
            let Some(worker) = state.workers.get_mut(&worker_id) else {
                return PollOutcome::Retired;
            };

            if let Some(payload) = worker.take_undelivered() {
                return PollOutcome::Work(payload);
            }
            if worker.is_unhealthy() && !worker.is_bound() {
                return PollOutcome::Retired;
            }

            let token = self.inner.poll_tokens.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            if let Some(previous) = worker.park(PollWaiter { token, tx }) {
                tracing::warn!(worker_id = %worker_id, "Overlapping poll; superseding the earlier one");
                let _ = previous.tx.send(Wake::Superseded);
            }
            break (token, rx);
        };

        let woke = tokio::select! {
            woke = &mut wake => woke.ok(),
            _ = tokio::time::sleep_until(poll_deadline) => {
                let mut state = self.inner.state.lock().await;
                if state
                    .workers
                    .get_mut(&worker_id)
                    .is_some_and(|w| w.unpark(token))
                {
                    return PollOutcome::NoWork;
                }
                drop(state);
                // Woken between the timer firing and taking the lock.
                wake.await.ok()
            }
        };

        match woke {
            Some(Wake::Work) => {
                let mut state = self.inner.state.lock().await;
                match state
                    .workers
                    .get_mut(&worker_id)
                    .and_then(|w| w.take_undelivered())
                {
                    Some(payload) => PollOutcome::Work(payload),
                    None => PollOutcome::NoWork,
                }
            }
            Some(Wake::Superseded) => PollOutcome::Superseded,
            Some(Wake::Retired) | None => PollOutcome::Retired,
        }
    }

    /// Complete the request bound to `worker_id`. Stale or duplicate pushes are ignored.
    pub async fn push_result(&self, worker_id: WorkerId, response: InvocationResponse) -> PushOutcome {
        let retired = {
            let mut state = self.inner.state.lock().await;
            let Some(worker) = state.workers.get_mut(&worker_id) else {
                tracing::warn!(worker_id = %worker_id, "Result pushed by unknown worker; ignoring");
                return PushOutcome::Ignored;
            };
            let Some(request) = worker.complete() else {
                tracing::warn!(worker_id = %worker_id, "Result pushed with no request bound; ignoring");
                return PushOutcome::Ignored;
            };
            let retiring = worker.is_unhealthy();

            let request_id = request.id;
            let elapsed_ms = request.created_at.elapsed().as_millis() as u64;
            let status = response.status;
            if !request.resolve(Ok(response)) {
                tracing::debug!(request_id = %request_id, "Caller went away before the result arrived");
            }
            tracing::info!(
                worker_id = %worker_id,
                request_id = %request_id,
                status,
                elapsed_ms,
                "Request completed"
            );

            if retiring {
                state.detach(worker_id)
            } else {
                state.drain_into(worker_id);
                None
            }
        };

        if let Some(worker) = retired {
            tracing::info!(worker_id = %worker.id, "Removing retired worker after its last request");
            self.dispose(vec![worker], PoolError::WorkerTerminated).await;
        }
        PushOutcome::Completed
    }
}

/// A dropped reply sender means the holder vanished without answering.
fn settle(
    result: Result<Result<InvocationResponse, PoolError>, RecvError>,
) -> Result<InvocationResponse, PoolError> {
    result.unwrap_or(Err(PoolError::WorkerTerminated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::test_support::{pool_with, settle as run_until_idle, test_config};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn spawn_admit(pool: &WorkerPool, url: &str) -> JoinHandle<Result<InvocationResponse, PoolError>> {
        let pool = pool.clone();
        let invocation = Invocation::new("GET", url);
        tokio::spawn(async move { pool.admit(invocation).await })
    }

    async fn worker_ids(pool: &WorkerPool) -> Vec<WorkerId> {
        pool.snapshot().await.workers.iter().map(|w| w.id).collect()
    }

    async fn take_work(pool: &WorkerPool, worker_id: WorkerId) -> Invocation {
        match pool.pull_work(worker_id, pool.current_version()).await {
            PollOutcome::Work(invocation) => invocation,
            other => panic!("expected work for {worker_id}, got {other:?}"),
        }
    }

    /// Busy workers must match requests bound and not yet completed.
    async fn assert_busy_matches_bound(pool: &WorkerPool) {
        let snapshot = pool.snapshot().await;
        let bound_busy = snapshot
            .workers
            .iter()
            .filter(|w| w.state == crate::worker::WorkerState::Busy)
            .all(|w| w.pending_request_id.is_some());
        assert!(bound_busy);
        assert_eq!(
            snapshot.busy(),
            snapshot
                .workers
                .iter()
                .filter(|w| w.pending_request_id.is_some()
                    && w.state != crate::worker::WorkerState::Unhealthy)
                .count()
        );
    }

    // Scenario: backpressure with a full pool.
    #[tokio::test(start_paused = true)]
    async fn test_backpressure_queues_third_request() {
        let (pool, _launcher) = pool_with(test_config(2, 2)).await;

        let a = spawn_admit(&pool, "/a");
        let b = spawn_admit(&pool, "/b");
        run_until_idle().await;
        let c = spawn_admit(&pool, "/c");
        run_until_idle().await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.busy(), 2);
        assert_eq!(snapshot.queued, 1);
        assert_busy_matches_bound(&pool).await;

        let ids = worker_ids(&pool).await;
        let first = take_work(&pool, ids[0]).await;
        let second = take_work(&pool, ids[1]).await;
        assert_ne!(first.url, second.url);

        // Freeing one worker binds the queued request to it immediately.
        assert_eq!(
            pool.push_result(ids[0], InvocationResponse::text(200, "first")).await,
            PushOutcome::Completed
        );
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.busy(), 2);

        let third = take_work(&pool, ids[0]).await;
        assert_eq!(third.url, "/c");
        pool.push_result(ids[0], InvocationResponse::text(200, "third")).await;
        pool.push_result(ids[1], InvocationResponse::text(200, "second")).await;

        assert_eq!(c.await.unwrap().unwrap().body, "third");
        let mut bodies = vec![a.await.unwrap().unwrap().body, b.await.unwrap().unwrap().body];
        bodies.sort();
        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(pool.snapshot().await.idle(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_poll_is_woken_by_admission() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];

        let poll = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pull_work(worker_id, CodeVersion::INITIAL).await }
        });
        run_until_idle().await;
        assert!(pool.snapshot().await.workers[0].polling);

        let admission = spawn_admit(&pool, "/wake");
        match poll.await.unwrap() {
            PollOutcome::Work(invocation) => assert_eq!(invocation.url, "/wake"),
            other => panic!("expected work, got {other:?}"),
        }

        pool.push_result(worker_id, InvocationResponse::new(202)).await;
        assert_eq!(admission.await.unwrap().unwrap().status, 202);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_no_work() {
        let config = PoolConfig {
            pull_timeout: Duration::from_millis(500),
            ..test_config(1, 1)
        };
        let (pool, _launcher) = pool_with(config).await;
        let worker_id = worker_ids(&pool).await[0];

        let started = tokio::time::Instant::now();
        assert_eq!(
            pool.pull_work(worker_id, CodeVersion::INITIAL).await,
            PollOutcome::NoWork
        );
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!pool.snapshot().await.workers[0].polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_poll_supersedes_first() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pull_work(worker_id, CodeVersion::INITIAL).await }
        });
        run_until_idle().await;
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pull_work(worker_id, CodeVersion::INITIAL).await }
        });
        run_until_idle().await;

        assert_eq!(first.await.unwrap(), PollOutcome::Superseded);

        let admission = spawn_admit(&pool, "/second");
        assert!(matches!(second.await.unwrap(), PollOutcome::Work(_)));
        pool.push_result(worker_id, InvocationResponse::new(200)).await;
        assert!(admission.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch_removes_idle_worker() {
        let (pool, launcher) = pool_with(test_config(0, 2)).await;
        let worker_id = pool.create_worker().await.unwrap();

        assert_eq!(
            pool.pull_work(worker_id, CodeVersion::new(7)).await,
            PollOutcome::VersionMismatch
        );
        assert!(worker_ids(&pool).await.is_empty());
        assert_eq!(launcher.stopped(), vec![worker_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_worker_poll_is_retired() {
        let (pool, _launcher) = pool_with(test_config(0, 1)).await;
        assert_eq!(
            pool.pull_work(uuid::Uuid::new_v4(), CodeVersion::INITIAL).await,
            PollOutcome::Retired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_undelivered_request_survives_dropped_poll() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];

        let poll = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pull_work(worker_id, CodeVersion::INITIAL).await }
        });
        run_until_idle().await;
        poll.abort();
        let _ = poll.await;

        let admission = spawn_admit(&pool, "/kept");
        run_until_idle().await;
        assert_eq!(take_work(&pool, worker_id).await.url, "/kept");
        pool.push_result(worker_id, InvocationResponse::new(200)).await;
        assert!(admission.await.unwrap().is_ok());
    }

    // Scenario: defensive push.
    #[tokio::test(start_paused = true)]
    async fn test_push_without_binding_is_ignored() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];
        let before = pool.snapshot().await;

        assert_eq!(
            pool.push_result(worker_id, InvocationResponse::new(200)).await,
            PushOutcome::Ignored
        );
        assert_eq!(
            pool.push_result(uuid::Uuid::new_v4(), InvocationResponse::new(200)).await,
            PushOutcome::Ignored
        );

        let after = pool.snapshot().await;
        assert_eq!(after.idle(), before.idle());
        assert_eq!(after.workers[0].request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_before_delivery_is_ignored() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];
        let admission = spawn_admit(&pool, "/early");
        run_until_idle().await;

        assert_eq!(
            pool.push_result(worker_id, InvocationResponse::new(200)).await,
            PushOutcome::Ignored
        );
        assert_eq!(pool.snapshot().await.busy(), 1);

        take_work(&pool, worker_id).await;
        pool.push_result(worker_id, InvocationResponse::new(200)).await;
        assert!(admission.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_push_is_noop() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];
        let admission = spawn_admit(&pool, "/once");
        run_until_idle().await;
        take_work(&pool, worker_id).await;

        assert_eq!(
            pool.push_result(worker_id, InvocationResponse::text(200, "one")).await,
            PushOutcome::Completed
        );
        assert_eq!(
            pool.push_result(worker_id, InvocationResponse::text(200, "two")).await,
            PushOutcome::Ignored
        );
        assert_eq!(admission.await.unwrap().unwrap().body, "one");
        assert_eq!(pool.snapshot().await.workers[0].request_count, 1);
    }

    // Scenario: queue timeout with no worker ever freeing.
    #[tokio::test(start_paused = true)]
    async fn test_queued_request_times_out() {
        let config = PoolConfig {
            queue_timeout: Duration::from_millis(300),
            ..test_config(1, 1)
        };
        let (pool, _launcher) = pool_with(config).await;

        let _busy = spawn_admit(&pool, "/busy");
        run_until_idle().await;
        let queued_before = pool.snapshot().await.queued;

        let started = tokio::time::Instant::now();
        let result = pool.admit(Invocation::new("GET", "/waits")).await;
        assert_eq!(result, Err(PoolError::AdmissionTimeout));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(pool.snapshot().await.queued, queued_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_fifo() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];

        let head = spawn_admit(&pool, "/head");
        run_until_idle().await;
        let a = spawn_admit(&pool, "/a");
        run_until_idle().await;
        let b = spawn_admit(&pool, "/b");
        run_until_idle().await;
        assert_eq!(pool.snapshot().await.queued, 2);

        for (expected, handle) in [("/head", head), ("/a", a), ("/b", b)] {
            assert_eq!(take_work(&pool, worker_id).await.url, expected);
            pool.push_result(worker_id, InvocationResponse::new(200)).await;
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_creates_worker_on_demand() {
        let (pool, launcher) = pool_with(test_config(0, 2)).await;
        assert!(worker_ids(&pool).await.is_empty());

        let admission = spawn_admit(&pool, "/cold");
        run_until_idle().await;

        let ids = worker_ids(&pool).await;
        assert_eq!(ids.len(), 1);
        assert_eq!(launcher.launches(), 1);
        take_work(&pool, ids[0]).await;
        pool.push_result(ids[0], InvocationResponse::new(200)).await;
        assert!(admission.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_surfaces_launch_failure() {
        let (pool, launcher) = pool_with(test_config(0, 1)).await;
        launcher.fail_launches(true);

        let result = pool.admit(Invocation::new("GET", "/x")).await;
        assert!(matches!(result, Err(PoolError::LaunchFailed(_))));

        let snapshot = pool.snapshot().await;
        assert!(snapshot.workers.is_empty());
        assert_eq!(snapshot.launching, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_removes_stuck_worker() {
        let config = PoolConfig {
            response_timeout: Some(Duration::from_secs(2)),
            ..test_config(0, 1)
        };
        let (pool, launcher) = pool_with(config).await;

        let admission = spawn_admit(&pool, "/hang");
        run_until_idle().await;
        let worker_id = worker_ids(&pool).await[0];
        take_work(&pool, worker_id).await;

        assert_eq!(admission.await.unwrap(), Err(PoolError::ResponseTimeout));
        assert!(worker_ids(&pool).await.is_empty());
        assert_eq!(launcher.stopped(), vec![worker_id]);
        assert_eq!(
            pool.push_result(worker_id, InvocationResponse::new(200)).await,
            PushOutcome::Ignored
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_hands_queue_to_new_worker() {
        let config = PoolConfig {
            response_timeout: Some(Duration::from_secs(2)),
            ..test_config(0, 1)
        };
        let (pool, launcher) = pool_with(config).await;

        let stuck = spawn_admit(&pool, "/hang");
        run_until_idle().await;
        let worker_id = worker_ids(&pool).await[0];
        take_work(&pool, worker_id).await;
        let waiting = spawn_admit(&pool, "/next");
        run_until_idle().await;
        assert_eq!(pool.snapshot().await.queued, 1);

        assert_eq!(stuck.await.unwrap(), Err(PoolError::ResponseTimeout));
        run_until_idle().await;

        let ids = worker_ids(&pool).await;
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], worker_id);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(take_work(&pool, ids[0]).await.url, "/next");
        pool.push_result(ids[0], InvocationResponse::text(200, "next")).await;
        assert_eq!(waiting.await.unwrap().unwrap().body, "next");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_worker_fails_bound_request() {
        let (pool, launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];
        let admission = spawn_admit(&pool, "/crash");
        run_until_idle().await;
        take_work(&pool, worker_id).await;

        launcher.kill(worker_id);
        let report = pool.health_check().await;
        assert_eq!(report.dead, 1);
        assert_eq!(admission.await.unwrap(), Err(PoolError::WorkerTerminated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_admission_is_skipped() {
        let (pool, _launcher) = pool_with(test_config(1, 1)).await;
        let worker_id = worker_ids(&pool).await[0];

        let head = spawn_admit(&pool, "/head");
        run_until_idle().await;
        let gone = spawn_admit(&pool, "/gone");
        run_until_idle().await;
        let kept = spawn_admit(&pool, "/kept");
        run_until_idle().await;
        gone.abort();
        let _ = gone.await;

        take_work(&pool, worker_id).await;
        pool.push_result(worker_id, InvocationResponse::new(200)).await;
        assert!(head.await.unwrap().is_ok());

        assert_eq!(take_work(&pool, worker_id).await.url, "/kept");
        pool.push_result(worker_id, InvocationResponse::new(200)).await;
        assert!(kept.await.unwrap().is_ok());
    }
}
