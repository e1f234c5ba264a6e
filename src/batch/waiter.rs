//! Facility to wait for a dynamic set of tasks to complete, with a single
//! waiter and multiple waitees.
//!
//! The continuous drain hands a [`WaitGuard`] to every send it spawns. When
//! the drain is stopped it drops its own guard and waits on the
//! [`WaitGroup`], which resolves once the last in-flight send has finished.

use futures::never::Never;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Waits for all [`WaitGuard`]s created alongside it to be dropped.
///
/// A [`WaitGroup`] is single-use: [`WaitGroup::wait`] consumes it.
#[derive(Debug)]
pub(crate) struct WaitGroup {
    /// Nothing is ever received; the channel closes once all senders are
    /// gone.
    recv: Receiver<Never>,
}

/// RAII guard held by a task which is being waited for.
///
/// Clone it to hand it to more tasks.
#[derive(Clone, Debug)]
pub(crate) struct WaitGuard {
    _send: Sender<Never>,
}

impl WaitGroup {
    /// Creates a new [`WaitGroup`] and its first [`WaitGuard`].
    pub(crate) fn new() -> (Self, WaitGuard) {
        let (send, recv) = channel(1);
        (Self { recv }, WaitGuard { _send: send })
    }

    /// Waits until all associated [`WaitGuard`]s are dropped.
    pub(crate) async fn wait(mut self) {
        let None = self.recv.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::WaitGroup;

    #[tokio::test]
    async fn test_waits_for_all_guards() {
        let (waiter, guard) = WaitGroup::new();
        for i in 0..3 {
            let guard = guard.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20 * i)).await;
                drop(guard);
            });
        }
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_outstanding_guard_blocks() {
        let (waiter, guard) = WaitGroup::new();
        let result = tokio::time::timeout(Duration::from_millis(100), waiter.wait()).await;
        assert!(result.is_err());
        drop(guard);
    }
}
