//! Time source shared by every poll-driven component.
//!
//! State machines never call `Instant::now()` directly; they read the clock
//! they were built with so tests can step time deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created
    fn now(&self) -> Duration;

    /// Wall-clock seconds since the Unix epoch
    fn unix_seconds(&self) -> u32;
}

pub type SharedClock = Arc<dyn Clock>;

/// Process clock backed by `Instant` and `chrono::Utc`
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn unix_seconds(&self) -> u32 {
        // Seconds fit in u32 until 2106
        chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
    }
}

/// Hand-stepped clock for tests
#[cfg(test)]
pub struct ManualClock {
    nanos: std::sync::atomic::AtomicU64,
    epoch_seconds: u32,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(epoch_seconds: u32) -> Arc<Self> {
        Arc::new(Self {
            nanos: std::sync::atomic::AtomicU64::new(0),
            epoch_seconds,
        })
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos
            .store(to.as_nanos() as u64, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn unix_seconds(&self) -> u32 {
        self.epoch_seconds + self.now().as_secs() as u32
    }
}
