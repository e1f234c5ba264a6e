//! Batches and the state the scheduler keeps around them.
//!
//! - [`Batch`]: a named FIFO of pending requests
//! - `session`: cookies and referer carried between requests to one host
//! - `observers`: callbacks and requeue predicates, dispatched best-effort
//! - [`Stats`]: cumulative processed/error/requeue counters
//! - `waiter`: lets the continuous drain wait for in-flight sends on stop

pub(crate) mod observers;
mod queue;
pub(crate) mod session;
mod stats;
pub(crate) mod waiter;

pub use observers::{Progress, RequeueDecision};
pub use queue::Batch;
pub(crate) use stats::Counters;
pub use stats::Stats;
