//! The interruptible polling loop (§4.2), the one primitive every runnable
//! is built from. Thread-per-tick timer tasks from the source are replaced
//! by a single task looping on an interruptible sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared handle a runnable uses to interrupt its own sleep (e.g. a pool
/// slot freed up) or request shutdown from another task (signal handler).
#[derive(Clone)]
pub struct PollerHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for PollerHandle {
    fn default() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl PollerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake an interruptible sleep immediately without requesting shutdown.
    pub fn wake_up(&self) {
        self.notify.notify_one();
    }

    /// Flip the shutdown flag and wake the sleeper; the loop exits after
    /// its current `poll()` returns.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `delay`, returning early if `wake_up`/`stop` is called, or
    /// immediately if `delay` is zero (drains a backlog without yielding a
    /// full tick).
    pub async fn interruptible_sleep(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Drives a `poll` closure in a loop: sleep interruptibly for whatever
/// duration the last poll returned, stop once `should_stop` says so.
pub async fn run_loop<F, Fut>(handle: PollerHandle, mut poll: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Duration>,
{
    loop {
        if handle.is_stopped() {
            break;
        }
        let delay = poll().await;
        if handle.is_stopped() {
            break;
        }
        handle.interruptible_sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn stop_breaks_the_loop_after_the_in_flight_poll_returns() {
        let handle = PollerHandle::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let loop_handle = handle.clone();
        let loop_ticks = ticks.clone();
        let task = tokio::spawn(async move {
            run_loop(loop_handle, || {
                let ticks = loop_ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    Duration::from_secs(60)
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop did not exit promptly after stop")
            .unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wake_up_interrupts_the_sleep_early() {
        let handle = PollerHandle::new();
        let woke = std::time::Instant::now();
        let sleeper = handle.clone();
        let task =
            tokio::spawn(async move { sleeper.interruptible_sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.wake_up();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sleep was not interrupted")
            .unwrap();
        assert!(woke.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn zero_delay_returns_immediately() {
        let handle = PollerHandle::new();
        let started = std::time::Instant::now();
        handle.interruptible_sleep(Duration::ZERO).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
