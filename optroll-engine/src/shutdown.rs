//! Cooperative shutdown signal shared by every long-running loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Cloneable flag + wakeup pair. `new` wires it to ctrl-c; tests and embedded
/// runtimes can trigger it manually.
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    /// Create a signal that fires on ctrl-c.
    pub fn new() -> Self {
        let signal = Self::manual();
        let flag = signal.flag.clone();
        let notify = signal.notify.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
                notify.notify_waiters();
            }
        });
        signal
    }

    /// Create a signal that only fires through [`ShutdownSignal::trigger`].
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while !self.triggered() {
            self.notify.notified().await;
        }
    }

    /// Sleep that returns `false` when interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiters_and_cancels_sleep() {
        let signal = ShutdownSignal::manual();
        assert!(!signal.triggered());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        signal.trigger();

        assert!(!handle.await.unwrap());
        assert!(signal.triggered());
        // Sleeping after the fact returns immediately.
        assert!(!signal.sleep(Duration::from_secs(30)).await);
    }
}
