//! Worker records.
//!
//! A worker owns its binding (the request it is executing) and its parked
//! poll directly, so there is no second map to keep in step.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::launcher::WorkerHandle;
use crate::protocol::Invocation;
use crate::queue::{PendingRequest, RequestId};
use crate::version::CodeVersion;

/// Identifier a worker presents on every poll and push.
pub type WorkerId = Uuid;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Ready for a new request.
    Idle,
    /// Holding exactly one request.
    Busy,
    /// Ineligible for new work; removed once it holds nothing.
    Unhealthy,
    /// Removed from the pool.
    Terminated,
}

/// Signal delivered to a parked poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// A request was bound to the worker.
    Work,
    /// A newer poll from the same worker replaced this one.
    Superseded,
    /// The worker left the pool.
    Retired,
}

#[derive(Debug)]
pub(crate) struct PollWaiter {
    pub token: u64,
    pub tx: oneshot::Sender<Wake>,
}

/// A request bound to a worker.
#[derive(Debug)]
pub(crate) struct Binding {
    pub request: PendingRequest,
    /// Whether the payload has been handed to one of the worker's polls.
    pub delivered: bool,
}

#[derive(Debug)]
pub(crate) struct Worker {
    pub id: WorkerId,
    pub state: WorkerState,
    pub code_version: CodeVersion,
    pub handle: WorkerHandle,
    pub started_at: DateTime<Utc>,
    pub last_used_at: Instant,
    pub request_count: u64,
    binding: Option<Binding>,
    waiter: Option<PollWaiter>,
}

impl Worker {
    pub fn new(handle: WorkerHandle, code_version: CodeVersion) -> Self {
        Self {
            id: handle.worker_id,
            state: WorkerState::Idle,
            code_version,
            handle,
            started_at: Utc::now(),
            last_used_at: Instant::now(),
            request_count: 0,
            binding: None,
            waiter: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state == WorkerState::Unhealthy
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn pending_request_id(&self) -> Option<RequestId> {
        self.binding.as_ref().map(|b| b.request.id)
    }

    /// Bind a request and wake a parked poll. The worker must be idle.
    pub fn bind(&mut self, request: PendingRequest) {
        debug_assert!(self.is_idle() && self.binding.is_none());
        tracing::debug!(worker_id = %self.id, request_id = %request.id, "Request bound");
        self.binding = Some(Binding {
            request,
            delivered: false,
        });
        self.state = WorkerState::Busy;
        self.wake(Wake::Work);
    }

    /// Hand out the bound payload if no poll has received it yet.
    pub fn take_undelivered(&mut self) -> Option<Invocation> {
        let binding = self.binding.as_mut()?;
        if binding.delivered {
            return None;
        }
        binding.delivered = true;
        Some(binding.request.payload.clone())
    }

    /// Take back a request no poll has seen, leaving the worker unbound.
    pub fn unbind_undelivered(&mut self) -> Option<PendingRequest> {
        if self.binding.as_ref().is_some_and(|b| !b.delivered) {
            if self.state == WorkerState::Busy {
                self.state = WorkerState::Idle;
            }
            return self.binding.take().map(|b| b.request);
        }
        None
    }

    /// Take the bound request, whatever its delivery status.
    pub fn unbind(&mut self) -> Option<PendingRequest> {
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Idle;
        }
        self.binding.take().map(|b| b.request)
    }

    /// Finish the delivered request. Returns `None` when nothing delivered is bound.
    pub fn complete(&mut self) -> Option<PendingRequest> {
        if !self.binding.as_ref().is_some_and(|b| b.delivered) {
            return None;
        }
        let request = self.binding.take().map(|b| b.request)?;
        self.request_count += 1;
        self.last_used_at = Instant::now();
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Idle;
        }
        Some(request)
    }

    /// Park a poll; returns the poll it replaces, if any.
    pub fn park(&mut self, waiter: PollWaiter) -> Option<PollWaiter> {
        self.waiter.replace(waiter)
    }

    /// Withdraw a parked poll after its timeout. False if it was already woken.
    pub fn unpark(&mut self, token: u64) -> bool {
        if self.waiter.as_ref().is_some_and(|w| w.token == token) {
            self.waiter = None;
            return true;
        }
        false
    }

    pub fn wake(&mut self, wake: Wake) {
        if let Some(waiter) = self.waiter.take() {
            // The poller may have gone away; a bound payload stays for its next poll.
            let _ = waiter.tx.send(wake);
        }
    }

    /// Mark the worker ineligible for new work.
    pub fn retire(&mut self) {
        if self.state != WorkerState::Terminated {
            self.state = WorkerState::Unhealthy;
        }
    }

    /// Split a removed worker into the parts that still need handling.
    pub fn terminate(mut self) -> (WorkerHandle, Option<PendingRequest>) {
        self.state = WorkerState::Terminated;
        self.wake(Wake::Retired);
        let request = self.binding.take().map(|b| b.request);
        (self.handle, request)
    }

    pub fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            state: self.state,
            code_version: self.code_version,
            pid: self.handle.pid,
            started_at: self.started_at,
            idle_ms: if self.is_bound() {
                0
            } else {
                now.saturating_duration_since(self.last_used_at).as_millis() as u64
            },
            request_count: self.request_count,
            pending_request_id: self.pending_request_id(),
            polling: self.waiter.is_some(),
        }
    }
}

/// Serializable view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    pub code_version: CodeVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub request_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_request_id: Option<RequestId>,
    pub polling: bool,
}
