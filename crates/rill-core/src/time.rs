//! Clock abstraction for delays and logical ticks.
//!
//! Debounced emission sleeps through a [`Clock`] taken from the ambient
//! context, so tests and simulators can control time. The default
//! [`TokioClock`] defers to `tokio::time`, which honours
//! `#[tokio::test(start_paused = true)]`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

/// Time source for delayed work and the logical clock.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Advance the logical clock by one minimal tick and yield to the
    /// scheduler. Returns the new tick.
    async fn tick(&self) -> u64;

    /// Current logical tick.
    fn ticks(&self) -> u64;
}

/// Clock backed by the Tokio timer.
#[derive(Debug, Default)]
pub struct TokioClock {
    ticks: AtomicU64,
}

impl TokioClock {
    /// A clock at tick zero.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    async fn tick(&self) -> u64 {
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        tokio::task::yield_now().await;
        tick
    }

    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}
