use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_restarts: u32,
    pub total_cancels: u32,
}

/// Owns the periodic report task. At most one timer task is alive at a
/// time; changing the period cancels the old task before spawning the
/// replacement.
#[derive(Debug, Default)]
pub struct Scheduler {
    period_ms: u64,
    handle: Option<JoinHandle<()>>,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Restart the report task unless one is already running at the
    /// requested period. Returns true when a new task was spawned.
    pub fn maybe_restart<F>(&mut self, period_ms: u64, spawn: F) -> bool
    where
        F: FnOnce(Duration) -> JoinHandle<()>,
    {
        debug_assert!(period_ms > 0, "Report period {period_ms}ms must be positive");

        if self.is_running() && self.period_ms == period_ms {
            return false;
        }

        self.cancel();
        self.period_ms = period_ms;
        self.handle = Some(spawn(Duration::from_millis(period_ms)));
        self.stats.total_restarts += 1;
        true
    }

    /// Stop the report task if one is alive. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                handle.abort();
            }
            self.stats.total_cancels += 1;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_idle(_period: Duration) -> JoinHandle<()> {
        tokio::spawn(async {
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn test_first_restart_spawns_task() {
        let mut scheduler = Scheduler::new();
        assert!(!scheduler.is_running());

        let spawned = scheduler.maybe_restart(10_000, spawn_idle);
        assert!(spawned);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.period_ms(), 10_000);
        assert_eq!(scheduler.stats().total_restarts, 1);
        assert_eq!(scheduler.stats().total_cancels, 0);
    }

    #[tokio::test]
    async fn test_same_period_is_noop() {
        let mut scheduler = Scheduler::new();
        scheduler.maybe_restart(10_000, spawn_idle);

        let spawned = scheduler.maybe_restart(10_000, spawn_idle);
        assert!(!spawned);
        assert_eq!(scheduler.stats().total_restarts, 1);
        assert_eq!(scheduler.stats().total_cancels, 0);
    }

    #[tokio::test]
    async fn test_new_period_cancels_and_respawns() {
        let mut scheduler = Scheduler::new();
        scheduler.maybe_restart(10_000, spawn_idle);

        let spawned = scheduler.maybe_restart(2_000, spawn_idle);
        assert!(spawned);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.period_ms(), 2_000);
        assert_eq!(scheduler.stats().total_restarts, 2);
        assert_eq!(scheduler.stats().total_cancels, 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut scheduler = Scheduler::new();
        scheduler.maybe_restart(10_000, spawn_idle);

        scheduler.cancel();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stats().total_cancels, 1);

        scheduler.cancel();
        assert_eq!(scheduler.stats().total_cancels, 1);
    }

    #[tokio::test]
    async fn test_restart_after_task_finished() {
        let mut scheduler = Scheduler::new();
        scheduler.maybe_restart(10_000, |_| tokio::spawn(async {}));

        // Let the short-lived task run to completion.
        tokio::task::yield_now().await;

        let spawned = scheduler.maybe_restart(10_000, spawn_idle);
        assert!(spawned);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.stats().total_restarts, 2);
    }
}
