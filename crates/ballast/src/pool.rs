//! Bounded task pool a worker runs claimed jobs on (§5: the only in-process
//! mutual exclusion this crate needs, since everything else is coordinated
//! through the database). The slot counter is a plain mutex-protected
//! integer — it must never be held across a database round-trip or the
//! user callable's execution.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runs futures with bounded concurrency and calls `on_idle` whenever a
/// slot frees up, so a waiting poller can wake up instead of waiting out a
/// full backoff.
#[derive(Clone)]
pub struct TaskPool {
    size: usize,
    in_flight: Arc<AtomicUsize>,
    on_idle: Arc<dyn Fn() + Send + Sync>,
}

impl TaskPool {
    pub fn new(size: usize, on_idle: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            on_idle: Arc::new(on_idle),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.size
            .saturating_sub(self.in_flight.load(Ordering::SeqCst))
    }

    pub fn is_idle(&self) -> bool {
        self.available_slots() > 0
    }

    /// Spawn `task` on the current Tokio runtime if a slot is free,
    /// returning `false` without spawning otherwise. The caller is expected
    /// to have already checked `available_slots()` when sizing its claim
    /// batch, so this should not normally race to full.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.size {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        let in_flight = self.in_flight.clone();
        let on_idle = self.on_idle.clone();
        tokio::spawn(async move {
            task.await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            on_idle();
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn respects_its_bound_and_reports_idle_via_callback() {
        let idled = Arc::new(AtomicBool::new(false));
        let idled_cb = idled.clone();
        let pool = TaskPool::new(1, move || idled_cb.store(true, Ordering::SeqCst));

        assert_eq!(pool.available_slots(), 1);
        assert!(pool.spawn(async { tokio::time::sleep(Duration::from_millis(20)).await }));
        assert_eq!(pool.available_slots(), 0);
        assert!(!pool.spawn(async {}));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.available_slots(), 1);
        assert!(idled.load(Ordering::SeqCst));
    }
}
