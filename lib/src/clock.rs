//! Monotonic time sources.
//!
//! Everything time-dependent in the kernel (timers, TCP retransmission,
//! conntrack expiry) reads "now" through the [`Clock`] trait instead of a
//! global counter, so the same code runs against the hardware timer in a
//! booted image and against a [`ManualClock`] in tests.

use core::cell::Cell;
use core::time::Duration;

/// A monotonic time source. `now()` never goes backwards.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin (usually boot).
    fn now(&self) -> Duration;
}

/// Clock backed by a platform function returning nanoseconds since boot.
#[derive(Clone, Copy)]
pub struct FnClock {
    monotonic_ns: fn() -> u64,
}

impl FnClock {
    pub const fn new(monotonic_ns: fn() -> u64) -> Self {
        Self { monotonic_ns }
    }
}

impl Clock for FnClock {
    #[inline]
    fn now(&self) -> Duration {
        Duration::from_nanos((self.monotonic_ns)())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
        }
    }

    /// Move time forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now.set(self.now.get() + delta);
    }

    /// Jump to an absolute time. Panics if that would move the clock backwards.
    pub fn set(&self, at: Duration) {
        assert!(at >= self.now.get(), "ManualClock cannot go backwards");
        self.now.set(at);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Returns `Duration` as whole milliseconds, saturating at `u64::MAX`.
#[inline]
pub fn as_millis_u64(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
