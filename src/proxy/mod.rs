//! Routing targets, their health and rotation among them.
//!
//! A [`RoutingTarget`] is either a direct connection or a forward proxy.
//! Wrapped into a [`TrackedTarget`] it accumulates failures reported by the
//! execution pipeline; a [`ProxyRotator`] only hands out targets which are
//! still below their failure threshold.

mod rotator;
mod target;
mod tracker;

pub use rotator::{
    LeastFailures, ProxyRotator, Random, RotationStrategy, RoundRobin, SelectionStrategy, Sticky,
};
pub use target::{DnsResolution, ProxyCredentials, ProxyDescriptor, ProxyScheme, RoutingTarget};
pub use tracker::{DEFAULT_MAX_FAILURES, TrackedTarget};
