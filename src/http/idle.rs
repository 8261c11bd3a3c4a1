//! Per-connection idle timer.
//!
//! One timer per connection, shared between the connection driver and the
//! response writer. The deadline lives in an atomic so that a write deep
//! inside a handler can push it out while the driver is waiting on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Sentinel value indicating the timer is not armed
const DISARMED: u64 = u64::MAX;

#[derive(Debug)]
pub struct IdleTimer {
    origin: Instant,
    /// Deadline in ms since `origin`, or `DISARMED`
    deadline_ms: AtomicU64,
    changed: Notify,
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: AtomicU64::new(DISARMED),
            changed: Notify::new(),
        }
    }

    /// (Re)arm the timer to fire `after` from now.
    pub fn arm(&self, after: Duration) {
        let at = (self.origin.elapsed() + after).as_millis() as u64;
        self.deadline_ms.store(at.min(DISARMED - 1), Ordering::Relaxed);
        self.changed.notify_waiters();
    }

    pub fn cancel(&self) {
        self.deadline_ms.store(DISARMED, Ordering::Relaxed);
        self.changed.notify_waiters();
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ms.load(Ordering::Relaxed) != DISARMED
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.deadline_ms.load(Ordering::Relaxed) {
            DISARMED => None,
            ms => Some(self.origin + Duration::from_millis(ms)),
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline().is_some_and(|at| Instant::now() >= at)
    }

    /// Resolves once the timer fires. Re-arming or cancelling while waiting
    /// moves the target; a disarmed timer never fires.
    pub async fn fired(&self) {
        loop {
            let changed = self.changed.notified();
            match self.deadline() {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            if self.expired() {
                                return;
                            }
                        }
                        _ = changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disarmed() {
        let timer = IdleTimer::new();
        assert!(!timer.is_armed());
        assert!(timer.deadline().is_none());
        assert!(!timer.expired());
    }

    #[test]
    fn test_arm_and_cancel() {
        let timer = IdleTimer::new();
        timer.arm(Duration::from_secs(30));
        assert!(timer.is_armed());
        assert!(!timer.expired());

        timer.cancel();
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_fires_after_deadline() {
        let timer = IdleTimer::new();
        timer.arm(Duration::from_millis(20));

        tokio::time::timeout(Duration::from_secs(2), timer.fired())
            .await
            .expect("timer should fire");
        assert!(timer.expired());
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let timer = IdleTimer::new();
        timer.arm(Duration::from_millis(20));
        timer.cancel();

        let res = tokio::time::timeout(Duration::from_millis(100), timer.fired()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_rearm_extends_deadline() {
        let timer = std::sync::Arc::new(IdleTimer::new());
        timer.arm(Duration::from_millis(50));

        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.fired().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        timer.arm(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!waiter.is_finished());

        timer.arm(Duration::from_millis(1));
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("timer should fire after re-arm")
            .unwrap();
    }
}
