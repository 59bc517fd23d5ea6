//! Monotonic clock abstraction.
//!
//! The original driver reads a monotonic "ticks" clock (`kmk::Time::GetTime`)
//! for every timestamp used in the acquisition pipeline — never wall-clock-
//! of-day. We model that as a small trait so tests can supply a fake clock
//! instead of depending on real sleeps to exercise timing-sensitive logic
//! (the 100ms recovery window, the 3s configuration timeout, the spectrum
//! poll cadence).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A source of monotonic milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Real monotonic clock, backed by [`std::time::Instant`].
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// A clock a test can advance by hand, with no dependency on real time.
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
