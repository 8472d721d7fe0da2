//! Admission queue: requests waiting for a free worker.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::PoolError;
use crate::protocol::{Invocation, InvocationResponse};

/// Identifier of one admitted request.
pub type RequestId = Uuid;

/// Channel resolving the ingress caller's future.
pub(crate) type Reply = oneshot::Sender<Result<InvocationResponse, PoolError>>;

/// Receiving side of a [`Reply`].
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<InvocationResponse, PoolError>>;

/// One admitted request, queued or bound to a worker.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub id: RequestId,
    pub payload: Invocation,
    pub created_at: Instant,
    pub deadline: Instant,
    reply: Reply,
}

impl PendingRequest {
    /// Create a request whose queue deadline is `queue_timeout` from now.
    pub fn new(payload: Invocation, queue_timeout: Duration) -> (Self, ReplyReceiver) {
        let (reply, rx) = oneshot::channel();
        let now = Instant::now();
        let request = Self {
            id: Uuid::new_v4(),
            payload,
            created_at: now,
            deadline: now + queue_timeout,
            reply,
        };
        (request, rx)
    }

    /// Complete the caller's future. Returns false if the caller went away.
    pub fn resolve(self, result: Result<InvocationResponse, PoolError>) -> bool {
        self.reply.send(result).is_ok()
    }

    /// The caller dropped its future; nobody is waiting for a result.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// FIFO of requests not yet bound to a worker.
#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    entries: VecDeque<PendingRequest>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_back(&mut self, request: PendingRequest) {
        self.entries.push_back(request);
    }

    /// Put requests back at the head, keeping their original arrival order.
    pub fn requeue_front(&mut self, mut requests: Vec<PendingRequest>) {
        requests.sort_by_key(|r| r.created_at);
        for request in requests.into_iter().rev() {
            self.entries.push_front(request);
        }
    }

    /// Next request whose caller is still waiting.
    pub fn pop_next(&mut self) -> Option<PendingRequest> {
        while let Some(request) = self.entries.pop_front() {
            if request.is_abandoned() {
                tracing::debug!(request_id = %request.id, "Skipping abandoned request");
                continue;
            }
            return Some(request);
        }
        None
    }

    /// Remove a specific request, if it is still queued.
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let index = self.entries.iter().position(|r| r.id == id)?;
        self.entries.remove(index)
    }

    /// Drop abandoned entries and fail those past their deadline.
    ///
    /// Callers normally time themselves out; this sweep only bounds memory
    /// for callers that vanished. Returns the number of entries removed.
    pub fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut kept = VecDeque::with_capacity(before);
        for request in self.entries.drain(..) {
            if request.is_abandoned() {
                continue;
            }
            if request.deadline <= now {
                request.resolve(Err(PoolError::AdmissionTimeout));
                continue;
            }
            kept.push_back(request);
        }
        self.entries = kept;
        before - self.entries.len()
    }

    /// Take every queued request, oldest first.
    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> (PendingRequest, ReplyReceiver) {
        PendingRequest::new(Invocation::new("GET", url), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mut queue = AdmissionQueue::new();
        let (a, _rx_a) = request("/a");
        let (b, _rx_b) = request("/b");
        queue.push_back(a);
        queue.push_back(b);

        assert_eq!(queue.pop_next().unwrap().payload.url, "/a");
        assert_eq!(queue.pop_next().unwrap().payload.url, "/b");
        assert!(queue.pop_next().is_none());
    }

    #[tokio::test]
    async fn test_pop_skips_abandoned() {
        let mut queue = AdmissionQueue::new();
        let (a, rx_a) = request("/a");
        let (b, _rx_b) = request("/b");
        queue.push_back(a);
        queue.push_back(b);
        drop(rx_a);

        assert_eq!(queue.pop_next().unwrap().payload.url, "/b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let mut queue = AdmissionQueue::new();
        let (a, _rx_a) = request("/a");
        let id = a.id;
        queue.push_back(a);

        assert!(queue.remove(id).is_some());
        assert!(queue.remove(id).is_none());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_front_keeps_arrival_order() {
        let mut queue = AdmissionQueue::new();
        let (a, _rx_a) = request("/a");
        tokio::time::advance(Duration::from_millis(1)).await;
        let (b, _rx_b) = request("/b");
        tokio::time::advance(Duration::from_millis(1)).await;
        let (c, _rx_c) = request("/c");
        queue.push_back(c);

        queue.requeue_front(vec![b, a]);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_next())
            .map(|r| r.payload.url)
            .collect();
        assert_eq!(order, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_fails_overdue_entries() {
        let mut queue = AdmissionQueue::new();
        let (a, rx_a) = PendingRequest::new(Invocation::new("GET", "/a"), Duration::from_millis(10));
        let (b, _rx_b) = request("/b");
        queue.push_back(a);
        queue.push_back(b);

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(queue.purge(Instant::now()), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(rx_a.await.unwrap(), Err(PoolError::AdmissionTimeout));
    }
}
