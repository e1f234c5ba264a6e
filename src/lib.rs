//! `volley` executes large numbers of outbound HTTP requests under a global
//! rate limit and concurrency bound, with retries, proxy rotation and a
//! requeue protocol.
//!
//! Requests are queued into named batches and drained by an [`Engine`]:
//!
//! ```no_run
//! use std::time::Duration;
//! use volley::{EngineBuilder, RequeueDecision, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let engine = EngineBuilder::builder()
//!       .rate_limit(10_usize)
//!       .rate_limit_window(Duration::from_secs(1))
//!       .build()
//!       .engine();
//!
//!   // Send anything rejected with 503 again later
//!   engine.requeue_on_response(|response, _| {
//!       if response.status == 503 {
//!           RequeueDecision::Requeue
//!       } else {
//!           RequeueDecision::Keep
//!       }
//!   });
//!
//!   engine.enqueue_url("pages", "https://example.com/")?;
//!   engine.enqueue_url("pages", "https://example.org/")?;
//!   for response in engine.run_batch("pages").await {
//!       println!("{response}");
//!   }
//!   Ok(())
//! }
//! ```
//!
//! A single request can also be sent right away with [`Engine::send`], and
//! [`Engine::start`] keeps draining all batches in the background.

mod config;
mod engine;
mod executor;
mod types;

pub mod batch;
pub mod hooks;
pub mod proxy;
pub mod ratelimit;
pub mod retry;
pub mod transport;

#[cfg(test)]
#[macro_use]
pub mod test_utils;

pub use batch::{Batch, Progress, RequeueDecision, Stats};
pub use config::{EngineConfig, ProxyConfig};
pub use engine::{
    DEFAULT_IDLE_INTERVAL, DEFAULT_MAX_CONCURRENCY, DEFAULT_TIMEOUT, Engine, EngineBuilder,
};
pub use executor::Executor;
pub use hooks::{RequestHook, ResponseHook};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use transport::{TransportOptions, TransportPool};
pub use types::*;
