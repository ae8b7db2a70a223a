//! Wall-clock access and deadline arithmetic.
//!
//! The controller never accumulates per-tick deltas. It arms an absolute
//! [`Deadline`] and recomputes the remaining time from it on every tick, so
//! missed ticks (backgrounded host, delayed timers) cannot introduce drift.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Source of "now" in epoch milliseconds.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// An absolute point in time at which the current timed phase ends.
///
/// `seq` identifies the arming; two deadlines with the same `at_ms` but
/// different `seq` belong to different phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    pub at_ms: u64,
    pub seq: u64,
}

impl Deadline {
    pub fn arm(now_ms: u64, duration_ms: u64, seq: u64) -> Self {
        Self {
            at_ms: now_ms.saturating_add(duration_ms),
            seq,
        }
    }

    /// `max(0, deadline - now)`.
    pub fn remaining(&self, now_ms: u64) -> u64 {
        self.at_ms.saturating_sub(now_ms)
    }

    /// Same arming, moved later by `delta_ms`.
    pub fn shift(&self, delta_ms: u64) -> Self {
        Self {
            at_ms: self.at_ms.saturating_add(delta_ms),
            seq: self.seq,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.at_ms
    }
}

/// Seconds (possibly fractional) to whole milliseconds.
pub fn duration_ms(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0).round() as u64
}
