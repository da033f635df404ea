//! Monotonic time source for submission timestamps and the watchdog.
//!
//! Timestamps are nanoseconds and never 0: a zero timestamp marks an idle
//! transmit slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary origin. Never returns 0.
    fn now_ns(&self) -> u64;
}

/// `Instant`-based clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 + 1
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at `start_ns` (raised to 1 if 0).
    pub fn new(start_ns: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_ns.max(1))) }
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns.max(1), Ordering::Release);
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
