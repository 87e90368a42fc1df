//! # Timing Module
//!
//! Monotonic millisecond clock and interval helpers shared by every
//! component. Components never keep timer state in common; each stores the
//! timestamps it needs and compares them against `now` with [`elapsed`].
//!
//! ```
//! use tank_gateway::timing::interval_elapsed;
//!
//! assert!(interval_elapsed(1_200, 1_000, 200));
//! assert!(!interval_elapsed(1_199, 1_000, 200));
//! ```

use std::cell::Cell;
use std::rc::Rc;

/// Milliseconds since an arbitrary, fixed origin.
pub type Millis = u64;

/// Source of monotonic time in milliseconds.
pub trait Clock {
    /// Current time in milliseconds since the clock's origin.
    fn now_ms(&self) -> Millis;
}

/// Milliseconds between `since` and `now`.
///
/// Saturates at zero if `since` lies in the future, so a timestamp taken
/// from a different clock never produces a huge elapsed value.
#[inline]
#[must_use]
pub fn elapsed(now: Millis, since: Millis) -> Millis {
    now.saturating_sub(since)
}

/// True once at least `interval` milliseconds separate `last` from `now`.
#[inline]
#[must_use]
pub fn interval_elapsed(now: Millis, last: Millis, interval: Millis) -> bool {
    elapsed(now, last) >= interval
}

/// Clock backed by `tokio::time::Instant`.
///
/// Follows tokio's paused test clock, so async tests can advance time
/// deterministically.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    /// Start a clock whose origin is the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same time source.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Millis>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Millis) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Millis) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_saturates() {
        assert_eq!(elapsed(100, 40), 60);
        assert_eq!(elapsed(40, 100), 0);
    }

    #[test]
    fn test_interval_elapsed_boundary() {
        assert!(interval_elapsed(300, 100, 200));
        assert!(!interval_elapsed(299, 100, 200));
        assert!(interval_elapsed(0, 0, 0));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(10);
        let other = clock.clone();
        clock.advance(15);
        assert_eq!(other.now_ms(), 25);
        other.set(1000);
        assert_eq!(clock.now_ms(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.now_ms(), 0);
        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms(), 1500);
    }
}
