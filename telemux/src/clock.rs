//! Wall-clock source for arrival timestamps.
//!
//! Arrival times feed the alignment state machine and the resend throttle, so
//! they are read through [`WallClock`] to let tests drive time by hand.

use std::sync::atomic::{AtomicI64, Ordering};

use minstant::{Anchor, Instant};

use crate::types::Micros;

/// Source of the current Unix time in microseconds.
pub trait WallClock: Send + Sync {
    fn now_micros(&self) -> Micros;
}

/// TSC-backed wall clock.
///
/// Reads the cycle counter through `minstant` and converts it to Unix time
/// using an anchor taken at construction.
pub struct SystemClock {
    anchor: Anchor,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Anchor::new(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemClock {
    #[inline]
    fn now_micros(&self) -> Micros {
        (Instant::now().as_unix_nanos(&self.anchor) / 1_000) as Micros
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: Micros) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Micros) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, by: Micros) {
        self.now.fetch_add(by, Ordering::AcqRel);
    }
}

impl WallClock for ManualClock {
    fn now_micros(&self) -> Micros {
        self.now.load(Ordering::Acquire)
    }
}
