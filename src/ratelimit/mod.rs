//! Global rate limiting.
//!
//! - [`RateLimiter`]: caps the number of request starts per time window,
//!   shared by every batch and the direct send path of one engine
//! - `headers`: turns `Retry-After` and `X-RateLimit-Reset` headers of a
//!   `429` response into a resume delay

pub(crate) mod headers;
mod limiter;

pub use limiter::{DEFAULT_RATE_LIMIT_WINDOW, RateLimiter};
