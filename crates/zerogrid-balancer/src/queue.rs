//! Per-service FIFO of requests waiting for an instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use zerogrid_core::{FabricError, FabricResult, ServiceId, UpstreamRequest, UpstreamResponse};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Completion handle the caller of `route` is waiting on.
pub type ReplyTx = oneshot::Sender<FabricResult<UpstreamResponse>>;

/// A request parked until an instance can take it.
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: String,
    pub service_id: ServiceId,
    pub request: UpstreamRequest,
    pub reply: ReplyTx,
    pub queued_at: Instant,
    /// Absolute deadline: `queued_at + request_timeout`.
    pub deadline: Instant,
    /// Dispatch attempts so far (requeues after a broken circuit).
    pub attempts: u32,
}

impl QueuedRequest {
    /// Build a request with a fresh id and its completion handle.
    pub fn new(
        service_id: &str,
        request: UpstreamRequest,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<FabricResult<UpstreamResponse>>) {
        let (reply, rx) = oneshot::channel();
        let now = Instant::now();
        let id = format!("req-{}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed));
        let queued = Self {
            id,
            service_id: service_id.to_string(),
            request,
            reply,
            queued_at: now,
            deadline: now + timeout,
            attempts: 0,
        };
        (queued, rx)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.queued_at)
    }

    pub fn timeout_error(&self, now: Instant) -> FabricError {
        FabricError::RequestTimeout {
            request_id: self.id.clone(),
            waited_ms: self.waited(now).as_millis() as u64,
        }
    }

    /// Resolve the caller. A caller that already gave up is ignored.
    pub fn respond(self, result: FabricResult<UpstreamResponse>) {
        let _ = self.reply.send(result);
    }
}

/// Bounded FIFO; only requeues may go to the front.
#[derive(Debug)]
pub struct ServiceQueue {
    requests: VecDeque<QueuedRequest>,
    max_size: usize,
}

impl ServiceQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.max_size
    }

    /// Append a new request, handing it back when the queue is full.
    pub fn push_back(&mut self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        if self.is_full() {
            return Err(request);
        }
        self.requests.push_back(request);
        Ok(())
    }

    /// Put a request back at the head. Not subject to the size bound:
    /// the request was admitted once already.
    pub fn push_front(&mut self, request: QueuedRequest) {
        self.requests.push_front(request);
    }

    pub fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.requests.pop_front()
    }

    /// Remove every request whose deadline has passed, in queue order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        if !self.requests.iter().any(|r| r.is_expired(now)) {
            return Vec::new();
        }
        let (expired, live): (VecDeque<_>, VecDeque<_>) =
            self.requests.drain(..).partition(|r| r.is_expired(now));
        self.requests = live;
        expired.into()
    }

    /// Remove everything (service unregistered).
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        self.requests.drain(..).collect()
    }
}
