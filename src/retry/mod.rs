//! Retry policy, backoff and classification of failed tries.

pub(crate) mod classify;
mod policy;

pub use policy::{
    BackoffStrategy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    DEFAULT_MULTIPLIER, RetryPolicy,
};
