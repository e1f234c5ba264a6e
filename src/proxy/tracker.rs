use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};

use super::RoutingTarget;

/// Default number of consecutive failures after which a target is excluded, 3.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// A routing target plus its health.
///
/// The failure counter is incremented whenever a try routed through the
/// target fails with a proxy error, and reset by every 2xx/3xx response.
/// Timeouts and other network errors leave it alone. Once it reaches `max_failures`
/// the target is no longer handed out by a [`super::ProxyRotator`]. There is
/// no time-based recovery: only a success resets the counter.
#[derive(Debug)]
pub struct TrackedTarget {
    target: RoutingTarget,
    failures: AtomicU32,
    max_failures: u32,
}

impl TrackedTarget {
    /// Track the given target, excluding it after `max_failures` failures.
    #[must_use]
    pub const fn new(target: RoutingTarget, max_failures: u32) -> Self {
        Self {
            target,
            failures: AtomicU32::new(0),
            max_failures,
        }
    }

    /// Track a direct connection
    #[must_use]
    pub const fn direct() -> Self {
        Self::new(RoutingTarget::Direct, DEFAULT_MAX_FAILURES)
    }

    /// The routing target
    #[must_use]
    pub const fn target(&self) -> &RoutingTarget {
        &self.target
    }

    /// Current number of consecutive failures
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Failure threshold
    #[must_use]
    pub const fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Whether the target may still be selected
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.failures() < self.max_failures
    }

    /// Record a successful try
    pub fn report_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Record a failed try
    pub fn report_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures == self.max_failures {
            log::info!("Routing target {} marked unavailable after {failures} failures", self.target);
        }
    }
}

impl Display for TrackedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.target.fmt(f)
    }
}
