//! Bounded waits on hardware conditions
//!
//! USB controllers guarantee that "FIFO ready" or "prime complete" bits
//! settle within microseconds. Faulty or unclocked hardware doesn't, so every
//! spin in this crate is bounded by a [`Clock`] and a timeout.
//!
//! Supply a real time base (a USB GPT, a SysTick counter, a timer
//! peripheral) by implementing [`Clock`]. Without one, [`SpinClock`] counts
//! each query as one microsecond, turning the timeout into an iteration
//! budget.
//!
//! ```
//! use tusb_core::wait::{SpinClock, Wait};
//!
//! let wait = Wait::new(SpinClock::new(), 10);
//! assert!(wait.until(|| false).is_err());
//! assert!(wait.until(|| true).is_ok());
//! ```

use core::cell::Cell;

/// Default bound for hardware-ready waits, in microseconds.
pub const DEFAULT_READY_TIMEOUT_US: u32 = 1_000;

/// A free-running microsecond counter
///
/// The counter may wrap.
pub trait Clock {
    /// Returns the current time, in microseconds.
    fn now_us(&self) -> u32;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u32 {
        (**self).now_us()
    }
}

/// A clock that advances by one on every query.
#[derive(Debug, Default)]
pub struct SpinClock {
    ticks: Cell<u32>,
}

impl SpinClock {
    /// Create a clock at zero.
    pub const fn new() -> Self {
        SpinClock {
            ticks: Cell::new(0),
        }
    }
}

impl Clock for SpinClock {
    fn now_us(&self) -> u32 {
        let now = self.ticks.get().wrapping_add(1);
        self.ticks.set(now);
        now
    }
}

/// The condition did not become true in time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct TimedOut;

/// A clock and a timeout.
#[derive(Debug)]
pub struct Wait<C> {
    clock: C,
    timeout_us: u32,
}

impl<C: Clock> Wait<C> {
    /// Bound waits on `clock` by `timeout_us`.
    pub const fn new(clock: C, timeout_us: u32) -> Self {
        Wait { clock, timeout_us }
    }

    /// Returns the timeout, in microseconds.
    pub fn timeout_us(&self) -> u32 {
        self.timeout_us
    }

    /// Change the timeout.
    pub fn set_timeout_us(&mut self, timeout_us: u32) {
        self.timeout_us = timeout_us;
    }

    /// Access the clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Spin until `ready` returns `true`, or until the timeout elapses.
    ///
    /// `ready` is always polled at least once.
    pub fn until(&self, mut ready: impl FnMut() -> bool) -> Result<(), TimedOut> {
        let start = self.clock.now_us();
        loop {
            if ready() {
                return Ok(());
            }
            if self.clock.now_us().wrapping_sub(start) >= self.timeout_us {
                // The condition might have settled while we read the clock.
                return if ready() { Ok(()) } else { Err(TimedOut) };
            }
        }
    }
}

impl Default for Wait<SpinClock> {
    fn default() -> Self {
        Wait::new(SpinClock::new(), DEFAULT_READY_TIMEOUT_US)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, SpinClock, TimedOut, Wait};
    use core::cell::Cell;

    /// A clock that jumps forward by a fixed step on every query.
    struct Stepper {
        now: Cell<u32>,
        step: u32,
    }

    impl Clock for Stepper {
        fn now_us(&self) -> u32 {
            let now = self.now.get().wrapping_add(self.step);
            self.now.set(now);
            now
        }
    }

    #[test]
    fn ready_immediately() {
        let wait = Wait::new(SpinClock::new(), 0);
        let mut polls = 0;
        assert_eq!(
            wait.until(|| {
                polls += 1;
                true
            }),
            Ok(())
        );
        assert_eq!(polls, 1);
    }

    #[test]
    fn ready_after_a_few_polls() {
        let wait = Wait::new(SpinClock::new(), 100);
        let mut polls = 0;
        assert_eq!(
            wait.until(|| {
                polls += 1;
                polls == 5
            }),
            Ok(())
        );
    }

    #[test]
    fn never_ready_times_out() {
        let wait = Wait::new(SpinClock::new(), 50);
        let mut polls = 0u32;
        assert_eq!(
            wait.until(|| {
                polls += 1;
                false
            }),
            Err(TimedOut)
        );
        // One poll per tick, plus the final re-check.
        assert!(polls <= 52);
    }

    #[test]
    fn clock_wraps() {
        let clock = Stepper {
            now: Cell::new(u32::MAX - 10),
            step: 4,
        };
        let wait = Wait::new(&clock, 20);
        assert_eq!(wait.until(|| false), Err(TimedOut));
        assert!(clock.now.get() < 100);
    }
}
