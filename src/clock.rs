//! Abstract time source so retry/timer logic can be driven deterministically
//! in tests instead of sleeping wall-clock time.
//!
//! Production code always uses [`TokioClock`]; tests use [`VirtualClock`].
//! This is the one timer idiom the whole crate shares (retry delays, session
//! timers, degradation timers, cooldown windows).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
    async fn wait(&self, dur: Duration);
}

/// Production clock backed by the tokio timer wheel.
#[derive(Debug, Clone, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn wait(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Test-only clock that only advances when explicitly told to via
/// [`VirtualClock::advance`]. `wait` blocks until the clock has been advanced
/// past the requested deadline, letting tests assert on exact schedules
/// instead of approximate ones.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    inner: Arc<Mutex<VirtualClockState>>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct VirtualClockState {
    epoch: Instant,
    elapsed: Duration,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtualClockState {
                epoch: Instant::now(),
                elapsed: Duration::ZERO,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Advance the virtual clock, waking any `wait` calls whose deadline has
    /// now passed.
    pub fn advance(&self, dur: Duration) {
        {
            let mut state = self.inner.lock();
            state.elapsed += dur;
        }
        self.notify.notify_waiters();
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.epoch + state.elapsed
    }

    async fn wait(&self, dur: Duration) {
        if dur.is_zero() {
            return;
        }
        let deadline = self.elapsed() + dur;
        loop {
            if self.elapsed() >= deadline {
                return;
            }
            let notified = self.notify.notified();
            if self.elapsed() >= deadline {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn virtual_clock_wait_returns_immediately_for_zero() {
        let clock = VirtualClock::new();
        clock.wait(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn virtual_clock_wait_unblocks_on_advance() {
        let clock = VirtualClock::new();
        let waiter_clock = clock.clone();
        let handle = tokio::spawn(async move {
            waiter_clock.wait(Duration::from_millis(500)).await;
        });

        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(200));
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(300));

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait should have unblocked")
            .unwrap();
    }
}
