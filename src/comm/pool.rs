//! Pool of outstanding non-blocking sends
//!
//! Replayed sends never block; their handles are parked here and reclaimed
//! whenever the driver reaches a checkpoint (the next communication event or
//! the end of a pass).

use super::Request;

#[derive(Debug)]
pub struct PendingPool {
    requests: Vec<Request>,
    capacity: usize,
}

impl PendingPool {
    pub fn new(capacity: usize) -> Self {
        PendingPool {
            requests: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, request: Request) {
        if self.requests.len() >= self.capacity {
            self.drain();
            if self.requests.len() >= self.capacity {
                // Sends never block, so the pool grows instead.
                self.capacity *= 2;
                tracing::debug!(capacity = self.capacity, "pending send pool grown");
            }
        }
        self.requests.push(request);
    }

    /// Drop every handle whose message has been matched
    pub fn drain(&mut self) -> usize {
        let before = self.requests.len();
        self.requests.retain(|r| !r.test());
        before - self.requests.len()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Cancel everything still outstanding; returns how many were cancelled
    pub fn cancel_all(&mut self) -> usize {
        self.drain();
        let count = self.requests.len();
        if count > 0 {
            tracing::warn!("Encountered {} unreceived send operations!", count);
        }
        for request in self.requests.drain(..) {
            request.cancel();
        }
        count
    }
}
