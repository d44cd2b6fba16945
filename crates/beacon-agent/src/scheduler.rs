//! Cancellable timers.
//!
//! Every recurring job in the agent goes through a [`Scheduler`]. Schedulers
//! form a tree of `CancellationToken`s: shutting a scheduler down cancels
//! every task it (or any child) started. A [`TaskHandle`] cancels its own
//! task on `cancel()` or on drop.

use std::future::Future;
use std::time::Duration;

use beacon_core::Clock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    token: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheduler that is shut down together with this one.
    pub fn child(&self) -> Scheduler {
        Scheduler {
            token: self.token.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `task` now and then every `every`.
    pub fn schedule<F>(&self, every: Duration, task: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_after(Duration::ZERO, every, task)
    }

    /// Run `task` after `delay` and then every `every`. Late ticks are
    /// delayed, never bunched up.
    pub fn schedule_after<F>(&self, delay: Duration, every: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.spawn(move |token| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if token.is_cancelled() {
                            break;
                        }
                        task();
                    }
                }
            }
        })
    }

    /// Run `task` once after `delay` unless cancelled first.
    pub fn once<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(move |token| async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        task();
                    }
                }
            }
        })
    }

    /// Spawn a long-running task that watches its own token.
    pub fn spawn<F, Fut>(&self, f: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        tokio::spawn(f(token.clone()));
        TaskHandle { token }
    }
}

/// Wall-clock milliseconds that follow tokio's clock, so paused-time tests and
/// the timers they drive agree on elapsed time.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_ms: i64,
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(beacon_core::SystemClock.now_ms())
    }

    pub fn starting_at(origin_ms: i64) -> Self {
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        self.origin_ms
            .saturating_add(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> (Arc<AtomicU32>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_immediately_then_periodically() {
        let scheduler = Scheduler::new();
        let (count, task) = counter();
        let _handle = scheduler.schedule(Duration::from_secs(10), task);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_waits_first() {
        let scheduler = Scheduler::new();
        let (count, task) = counter();
        let _handle = scheduler.schedule_after(Duration::from_secs(5), Duration::from_secs(5), task);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let scheduler = Scheduler::new();
        let (count, task) = counter();
        let handle = scheduler.schedule(Duration::from_secs(1), task);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.cancel();
        assert!(handle.is_cancelled());
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let scheduler = Scheduler::new();
        let (count, task) = counter();
        drop(scheduler.schedule_after(Duration::from_secs(1), Duration::from_secs(1), task));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cascades_to_children() {
        let root = Scheduler::new();
        let child = root.child();
        let (count, task) = counter();
        let handle = child.schedule_after(Duration::from_secs(1), Duration::from_secs(1), task);

        root.shutdown();
        assert!(child.is_shut_down());
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_runs_once() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let _handle = scheduler.once(Duration::from_secs(3), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(clock.now_ms(), 8_000);
    }
}
