use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cumulative counters of an engine.
///
/// The counters are advisory: a reset racing with finishing requests may
/// lose a few increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Finished logical sends, successful or not
    pub processed: u64,
    /// Logical sends which failed for good
    pub errors: u64,
    /// Requests appended to a batch again by the requeue protocol
    pub requeued: u64,
}

impl Stats {
    /// Finished logical sends which produced a response
    #[must_use]
    pub const fn successful(&self) -> u64 {
        self.processed.saturating_sub(self.errors)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    processed: AtomicU64,
    errors: AtomicU64,
    requeued: AtomicU64,
}

impl Counters {
    pub(crate) fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeue(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.requeued.store(0, Ordering::Relaxed);
    }
}
