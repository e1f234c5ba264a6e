use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{ErrorKind, Result};

/// Default length of a rate limiting window, 1 second.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct WindowState {
    limit: usize,
    window: Duration,
    started: Instant,
    count: usize,
}

impl WindowState {
    /// Try to grant `n` starts. Returns how long to wait otherwise.
    fn try_grant(&mut self, n: usize, now: Instant) -> Option<Duration> {
        let mut elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.window {
            self.count = 0;
        }
        // A window opens with its first grant, not when the limiter was
        // built or reconfigured.
        if self.count == 0 {
            self.started = now;
            elapsed = Duration::ZERO;
        }

        // A grant larger than the whole limit would never fit, so it is
        // allowed to use up a fresh window on its own.
        if self.count > 0 && self.count + n > self.limit {
            return Some(self.window.saturating_sub(elapsed.min(self.window)));
        }

        self.count += n;
        None
    }
}

/// Caps the number of starts per fixed time window.
///
/// All callers sharing one limiter share one budget: a wave of a batch, a
/// request picked up by the continuous drain and a direct send all count
/// against the same window. A limit of `0` disables limiting.
///
/// The window bookkeeping happens under a short mutex; waiting for the next
/// window happens outside of it so other callers are not blocked.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<WindowState>,
}

impl RateLimiter {
    /// Create a limiter admitting at most `limit` starts per `window`.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            state: Mutex::new(WindowState {
                limit,
                window,
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// A limiter which admits everything immediately
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0, DEFAULT_RATE_LIMIT_WINDOW)
    }

    /// Maximum number of starts per window, `0` if disabled
    #[must_use]
    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Length of a window
    #[must_use]
    pub fn window(&self) -> Duration {
        self.lock().window
    }

    /// Whether limiting is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.limit() > 0
    }

    /// Change the ceiling. The current window is restarted.
    pub fn reconfigure(&self, limit: usize, window: Duration) {
        let mut state = self.lock();
        state.limit = limit;
        state.window = window;
        state.started = Instant::now();
        state.count = 0;
    }

    /// Wait until a single start is admitted.
    pub async fn admit(&self) {
        self.admit_many(1).await;
    }

    /// Wait until `n` starts are admitted as one unit.
    pub async fn admit_many(&self, n: usize) {
        while let Some(wait) = self.try_admit(n) {
            log::debug!("Rate limit reached, waiting {}ms", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
    }

    /// Like [`RateLimiter::admit_many`], but gives up once `token` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::CallerCancelled`] if the token fires before the
    /// starts were admitted. Nothing is counted in that case.
    pub async fn admit_many_or_cancel(&self, n: usize, token: &CancellationToken) -> Result<()> {
        loop {
            if token.is_cancelled() {
                return Err(ErrorKind::CallerCancelled);
            }
            let Some(wait) = self.try_admit(n) else {
                return Ok(());
            };
            log::debug!("Rate limit reached, waiting {}ms", wait.as_millis());
            tokio::select! {
                () = token.cancelled() => return Err(ErrorKind::CallerCancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn try_admit(&self, n: usize) -> Option<Duration> {
        let mut state = self.lock();
        if state.limit == 0 || n == 0 {
            return None;
        }
        state.try_grant(n, Instant::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        // The state is a pair of counters that stays consistent even if a
        // holder panicked, so poisoning is ignored.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::RateLimiter;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_unlimited_admits_immediately() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.admit().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!limiter.is_enabled());
    }

    #[tokio::test]
    async fn test_ceiling_across_callers() {
        let window = Duration::from_millis(300);
        let limiter = Arc::new(RateLimiter::new(3, window));
        let start = Instant::now();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.admit().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waves_use_whole_windows() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        limiter.admit_many(2).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.admit_many(2).await;
        assert!(start.elapsed() >= Duration::from_secs(1));

        limiter.admit_many(1).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_opens_with_first_grant() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(900)).await;

        let start = Instant::now();
        for _ in 0..3 {
            limiter.admit_many(2).await;
        }
        assert!(start.elapsed() >= Duration::from_secs(2));

        // Same after a reconfiguration followed by an idle period
        limiter.reconfigure(1, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(900)).await;
        let start = Instant::now();
        limiter.admit().await;
        limiter.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_grant_uses_fresh_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.admit_many(5).await;
        assert!(start.elapsed() < Duration::from_millis(10));
        limiter.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
        limiter.admit().await;

        let token = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let token = token.clone();
            tokio::spawn(async move { limiter.admit_many_or_cancel(1, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ErrorKind::CallerCancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.admit().await;
        limiter.reconfigure(0, Duration::from_secs(1));
        let start = Instant::now();
        limiter.admit().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(limiter.limit(), 0);
    }
}
