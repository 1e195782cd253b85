//! Monotonic clock source used for frame recency stamps.

use core::sync::atomic::{AtomicU64, Ordering};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A point in time as reported by the clock collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp {
            secs: nanos / NANOS_PER_SEC,
            nanos: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.secs * NANOS_PER_SEC + self.nanos as u64
    }
}

/// Monotonic time source. Only used for recency, never for wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Clock that advances by a fixed step every time it is read.
pub struct TickClock {
    nanos: AtomicU64,
    step: u64,
}

impl TickClock {
    pub const fn new(step_nanos: u64) -> Self {
        TickClock {
            nanos: AtomicU64::new(0),
            step: step_nanos,
        }
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl Clock for TickClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.nanos.fetch_add(self.step, Ordering::SeqCst) + self.step)
    }
}
