use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::PendingRequest;

/// A named FIFO of pending requests.
///
/// A batch is passive: the engine pulls requests out of it, callers and the
/// requeue protocol push requests into it. Every request is handed to at
/// most one consumer.
#[derive(Debug)]
pub struct Batch {
    name: String,
    queue: Mutex<VecDeque<PendingRequest>>,
}

impl Batch {
    /// Create an empty batch
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Name of the batch
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a request to the tail
    pub fn push(&self, request: PendingRequest) {
        self.lock().push_back(request);
    }

    /// Append several requests to the tail, keeping their order
    pub fn extend(&self, requests: impl IntoIterator<Item = PendingRequest>) {
        self.lock().extend(requests);
    }

    /// Put a request back at the head
    pub(crate) fn push_front(&self, request: PendingRequest) {
        self.lock().push_front(request);
    }

    /// Take the request at the head
    pub(crate) fn pop(&self) -> Option<PendingRequest> {
        self.lock().pop_front()
    }

    /// Take every queued request, in order
    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        self.lock().drain(..).collect()
    }

    /// Number of queued requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every queued request and return how many there were
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
