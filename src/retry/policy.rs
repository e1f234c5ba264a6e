use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ErrorKind, FailureCategory};

/// Default number of retries before a request is deemed as failed, 3.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default wait before the first retry, 1 second.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound for a single backoff wait, 30 seconds.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default growth factor for exponential backoff, 2.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// How the wait between two tries grows with the retry number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always wait the initial delay
    Fixed,
    /// Wait `initial_delay * attempt`
    Linear,
    /// Wait `initial_delay * multiplier^(attempt - 1)`
    #[default]
    Exponential,
}

/// Immutable description of how failed tries of a request are retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of retries, so a request is tried at most
    /// `max_retries + 1` times
    pub max_retries: u32,

    /// Backoff strategy between tries
    pub strategy: BackoffStrategy,

    /// Wait before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single wait
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor for [`BackoffStrategy::Exponential`]
    pub multiplier: f64,

    /// Retry when a try timed out
    pub retry_on_timeout: bool,

    /// Retry on generic transport errors
    pub retry_on_network_error: bool,

    /// Retry when the forward proxy failed
    pub retry_on_proxy_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            strategy: BackoffStrategy::default(),
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            retry_on_timeout: true,
            retry_on_network_error: true,
            retry_on_proxy_error: true,
        }
    }
}

impl RetryPolicy {
    /// A policy which never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the maximum number of retries
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff strategy, initial delay and maximum delay
    #[must_use]
    pub const fn with_backoff(
        mut self,
        strategy: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        self.strategy = strategy;
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the growth factor for exponential backoff
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Wait before retry number `attempt`.
    ///
    /// `attempt` 0 is the initial try and never waits. The result never
    /// exceeds [`RetryPolicy::max_delay`].
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self
                .initial_delay
                .checked_mul(attempt)
                .unwrap_or(self.max_delay),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let factor = self.multiplier.max(0.0).powi(exponent);
                #[allow(clippy::cast_precision_loss)]
                let nanos = (self.initial_delay.as_nanos() as f64 * factor).round();
                if nanos.is_finite() && nanos < u64::MAX as f64 {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let nanos = nanos as u64;
                    Duration::from_nanos(nanos)
                } else {
                    self.max_delay
                }
            }
        };

        delay.min(self.max_delay)
    }

    /// Whether the policy allows retrying after the given error.
    ///
    /// This only looks at the kind of failure, not at the remaining budget.
    #[must_use]
    pub const fn allows(&self, error: &ErrorKind) -> bool {
        match error.category() {
            FailureCategory::RateLimited => true,
            FailureCategory::Timeout => self.retry_on_timeout,
            FailureCategory::Network => self.retry_on_network_error,
            FailureCategory::Proxy => self.retry_on_proxy_error,
            FailureCategory::CallerCancelled | FailureCategory::Terminal => false,
        }
    }

    /// Total number of tries a logical send may use
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
