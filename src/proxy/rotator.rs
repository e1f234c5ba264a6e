use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use super::{ProxyDescriptor, RoutingTarget, TrackedTarget};

/// Picks one routing target out of the currently available ones.
///
/// `available` is never empty and only holds targets for which
/// [`TrackedTarget::is_available`] was true right before the call. `key`
/// partitions selections, the engine passes the destination host.
pub trait SelectionStrategy: Debug + Send + Sync {
    /// Select a target
    fn select(
        &self,
        available: &[Arc<TrackedTarget>],
        key: Option<&str>,
    ) -> Option<Arc<TrackedTarget>>;
}

/// Hands out targets in a cycle
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn select(
        &self,
        available: &[Arc<TrackedTarget>],
        _key: Option<&str>,
    ) -> Option<Arc<TrackedTarget>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        available.get(index % available.len().max(1)).cloned()
    }
}

/// Uniformly random choice
#[derive(Debug, Default)]
pub struct Random;

impl SelectionStrategy for Random {
    fn select(
        &self,
        available: &[Arc<TrackedTarget>],
        _key: Option<&str>,
    ) -> Option<Arc<TrackedTarget>> {
        available.choose(&mut rand::rng()).cloned()
    }
}

/// Target with the fewest failures, earlier targets win ties
#[derive(Debug, Default)]
pub struct LeastFailures;

impl SelectionStrategy for LeastFailures {
    fn select(
        &self,
        available: &[Arc<TrackedTarget>],
        _key: Option<&str>,
    ) -> Option<Arc<TrackedTarget>> {
        // `min_by_key` returns the first minimum
        available.iter().min_by_key(|t| t.failures()).cloned()
    }
}

/// Keeps returning the same target for a key while it stays available.
#[derive(Debug)]
pub struct Sticky {
    assigned: DashMap<String, Arc<TrackedTarget>>,
    fallback: Box<dyn SelectionStrategy>,
}

impl Sticky {
    /// Re-select through `fallback` when a key has no usable target
    #[must_use]
    pub fn new(fallback: Box<dyn SelectionStrategy>) -> Self {
        Self {
            assigned: DashMap::new(),
            fallback,
        }
    }
}

impl Default for Sticky {
    fn default() -> Self {
        Self::new(Box::new(RoundRobin::default()))
    }
}

impl SelectionStrategy for Sticky {
    fn select(
        &self,
        available: &[Arc<TrackedTarget>],
        key: Option<&str>,
    ) -> Option<Arc<TrackedTarget>> {
        let Some(key) = key else {
            return self.fallback.select(available, None);
        };

        if let Some(target) = self.assigned.get(key)
            && target.is_available()
        {
            return Some(Arc::clone(&target));
        }

        let target = self.fallback.select(available, Some(key))?;
        self.assigned.insert(key.to_string(), Arc::clone(&target));
        Some(target)
    }
}

/// Built-in selection strategies, as used in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// See [`RoundRobin`]
    #[default]
    RoundRobin,
    /// See [`Random`]
    Random,
    /// See [`LeastFailures`]
    LeastFailures,
    /// See [`Sticky`], falling back to round-robin
    Sticky,
}

impl RotationStrategy {
    /// Create the strategy
    #[must_use]
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::Random => Box::new(Random),
            Self::LeastFailures => Box::new(LeastFailures),
            Self::Sticky => Box::new(Sticky::default()),
        }
    }
}

/// Selects routing targets among the healthy ones of a fixed set.
#[derive(Debug)]
pub struct ProxyRotator {
    targets: Vec<Arc<TrackedTarget>>,
    strategy: Box<dyn SelectionStrategy>,
}

impl ProxyRotator {
    /// Rotate over the given tracked targets
    #[must_use]
    pub fn new(targets: Vec<Arc<TrackedTarget>>, strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { targets, strategy }
    }

    /// Track each proxy with the same failure threshold and rotate over them
    #[must_use]
    pub fn from_proxies(
        proxies: impl IntoIterator<Item = ProxyDescriptor>,
        max_failures: u32,
        strategy: RotationStrategy,
    ) -> Self {
        let targets = proxies
            .into_iter()
            .map(|proxy| Arc::new(TrackedTarget::new(RoutingTarget::Proxy(proxy), max_failures)))
            .collect();
        Self::new(targets, strategy.build())
    }

    /// Pick an available target, `None` if all of them are exhausted.
    #[must_use]
    pub fn select(&self, key: Option<&str>) -> Option<Arc<TrackedTarget>> {
        let available: Vec<_> = self
            .targets
            .iter()
            .filter(|t| t.is_available())
            .cloned()
            .collect();
        if available.is_empty() {
            return None;
        }
        self.strategy.select(&available, key)
    }

    /// All tracked targets, available or not
    #[must_use]
    pub fn targets(&self) -> &[Arc<TrackedTarget>] {
        &self.targets
    }

    /// Number of targets which may currently be selected
    #[must_use]
    pub fn available(&self) -> usize {
        self.targets.iter().filter(|t| t.is_available()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{ProxyRotator, RotationStrategy};
    use crate::proxy::{ProxyDescriptor, ProxyScheme};

    fn rotator(n: u16, strategy: RotationStrategy) -> ProxyRotator {
        ProxyRotator::from_proxies(
            (0..n).map(|i| ProxyDescriptor::new(ProxyScheme::Http, "127.0.0.1", 8000 + i)),
            2,
            strategy,
        )
    }

    #[test]
    fn test_round_robin_is_fair() {
        let rotator = rotator(3, RotationStrategy::RoundRobin);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let target = rotator.select(None).unwrap();
            *counts.entry(target.to_string()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 3));
    }

    #[test]
    fn test_round_robin_alternates() {
        let rotator = rotator(2, RotationStrategy::RoundRobin);
        let [a, b] = [&rotator.targets()[0], &rotator.targets()[1]];
        let picks: Vec<_> = (0..3).map(|_| rotator.select(None).unwrap()).collect();
        assert!(Arc::ptr_eq(&picks[0], a));
        assert!(Arc::ptr_eq(&picks[1], b));
        assert!(Arc::ptr_eq(&picks[2], a));
    }

    #[rstest]
    #[case(RotationStrategy::RoundRobin)]
    #[case(RotationStrategy::Random)]
    #[case(RotationStrategy::LeastFailures)]
    #[case(RotationStrategy::Sticky)]
    fn test_skips_unavailable(#[case] strategy: RotationStrategy) {
        let rotator = rotator(2, strategy);
        let broken = Arc::clone(&rotator.targets()[0]);
        broken.report_failure();
        broken.report_failure();
        assert_eq!(rotator.available(), 1);

        for _ in 0..10 {
            let target = rotator.select(Some("example.com")).unwrap();
            assert!(!Arc::ptr_eq(&target, &broken));
        }

        rotator.targets()[1].report_failure();
        rotator.targets()[1].report_failure();
        assert!(rotator.select(Some("example.com")).is_none());
    }

    #[test]
    fn test_least_failures_prefers_first_on_tie() {
        let rotator = rotator(3, RotationStrategy::LeastFailures);
        let first = rotator.select(None).unwrap();
        assert!(Arc::ptr_eq(&first, &rotator.targets()[0]));

        rotator.targets()[0].report_failure();
        let second = rotator.select(None).unwrap();
        assert!(Arc::ptr_eq(&second, &rotator.targets()[1]));
    }

    #[test]
    fn test_sticky_per_key() {
        let rotator = rotator(3, RotationStrategy::Sticky);
        let a = rotator.select(Some("a.example")).unwrap();
        let b = rotator.select(Some("b.example")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        for _ in 0..5 {
            assert!(Arc::ptr_eq(&rotator.select(Some("a.example")).unwrap(), &a));
        }

        a.report_failure();
        a.report_failure();
        let replacement = rotator.select(Some("a.example")).unwrap();
        assert!(!Arc::ptr_eq(&replacement, &a));
        assert!(Arc::ptr_eq(
            &rotator.select(Some("a.example")).unwrap(),
            &replacement
        ));
    }

    #[test]
    fn test_empty_rotator() {
        let rotator = rotator(0, RotationStrategy::RoundRobin);
        assert!(rotator.select(None).is_none());
    }
}
