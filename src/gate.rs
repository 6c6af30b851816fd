use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// One-shot startup gate: set once, observed by any number of waiters.
///
/// Connection startup blocks on this until the first config lands (or an
/// error forces it open); releasing an already-released gate is a no-op.
#[derive(Debug, Default)]
pub struct StartupGate {
    released: AtomicBool,
    notify: Notify,
}

impl StartupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually released the gate.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the gate; true when released in time.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_released() {
            return true;
        }
        let released = async {
            loop {
                // Arm the notification before the flag check so a release
                // landing between the two cannot be missed.
                let notified = self.notify.notified();
                if self.is_released() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, released).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_after_release_is_immediate() {
        let gate = StartupGate::new();
        assert!(gate.release());
        assert!(gate.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_release_is_one_shot() {
        let gate = StartupGate::new();
        assert!(gate.release());
        assert!(!gate.release());
        assert!(gate.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let gate = StartupGate::new();
        assert!(!gate.wait(Duration::from_secs(10)).await);
        assert!(!gate.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_observes_concurrent_release() {
        let gate = Arc::new(StartupGate::new());
        let releaser = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            releaser.release();
        });
        assert!(gate.wait(Duration::from_secs(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_waiters_all_released() {
        let gate = Arc::new(StartupGate::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            waiters.push(tokio::spawn(async move {
                gate.wait(Duration::from_secs(10)).await
            }));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        gate.release();
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
    }
}
