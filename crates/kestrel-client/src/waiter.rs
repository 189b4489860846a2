// Pending-operation counter used to hold shutdown until in-flight work drains.
use std::pin::pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::clock::Clock;

#[derive(Debug, Default)]
pub struct Waiter {
    pending: AtomicI64,
    drained: Notify,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to the pending count; a negative delta marks completed work.
    pub fn increment_pending_count(&self, delta: i64) {
        let now = self.pending.fetch_add(delta, Ordering::AcqRel) + delta;
        if now <= 0 {
            self.drained.notify_waiters();
        }
    }

    pub fn pending_count(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub async fn wait_complete(&self) {
        loop {
            let mut notified = pin!(self.drained.notified());
            // Register before checking so a concurrent drain cannot be missed.
            notified.as_mut().enable();
            if self.pending_count() <= 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits up to `timeout` for the count to reach zero and reports whether it did.
    pub async fn try_wait(&self, timeout: Duration, clock: &dyn Clock) -> bool {
        let start = clock.now();
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.pending_count() <= 0 {
                return true;
            }
            let elapsed = clock.now().saturating_duration_since(start);
            let Some(remaining) = timeout.checked_sub(elapsed).filter(|d| !d.is_zero()) else {
                return false;
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    return self.pending_count() <= 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_complete_returns_when_idle() {
        let waiter = Waiter::new();
        waiter.wait_complete().await;
        waiter.increment_pending_count(1);
        waiter.increment_pending_count(-1);
        waiter.wait_complete().await;
    }

    #[tokio::test]
    async fn wait_complete_wakes_on_drain() {
        let waiter = Arc::new(Waiter::new());
        waiter.increment_pending_count(2);
        let task = tokio::spawn({
            let waiter = waiter.clone();
            async move { waiter.wait_complete().await }
        });
        tokio::task::yield_now().await;
        waiter.increment_pending_count(-1);
        assert!(!task.is_finished());
        waiter.increment_pending_count(-1);
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn try_wait_times_out_with_pending_work() {
        let waiter = Waiter::new();
        waiter.increment_pending_count(1);
        let start = tokio::time::Instant::now();
        assert!(!waiter.try_wait(Duration::from_secs(5), &SystemClock).await);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn try_wait_returns_true_once_drained() {
        let waiter = Arc::new(Waiter::new());
        waiter.increment_pending_count(1);
        tokio::spawn({
            let waiter = waiter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                waiter.increment_pending_count(-1);
            }
        });
        assert!(waiter.try_wait(Duration::from_secs(10), &SystemClock).await);
    }

    #[tokio::test]
    async fn try_wait_with_zero_timeout_does_not_block() {
        let waiter = Waiter::new();
        waiter.increment_pending_count(1);
        assert!(!waiter.try_wait(Duration::ZERO, &ManualClock::new()).await);
    }
}
