//! Bounded busy-wait helpers.
//!
//! Every wait in the core (byte transmit completion, Modbus idle time,
//! driver-enable delays) goes through one of these loops. They service the
//! watchdog on each iteration and compare elapsed time with wrapping
//! arithmetic, so counter roll-over is harmless.

use crate::hal::{Clock, FineCounter, Watchdog};

/// Poll `done` until it returns `true` or `timeout_ms` milliseconds elapse.
///
/// Returns `true` if the condition was met before the deadline.
pub fn poll_until<C, W, F>(clock: &C, watchdog: &W, timeout_ms: u32, mut done: F) -> bool
where
    C: Clock + ?Sized,
    W: Watchdog + ?Sized,
    F: FnMut() -> bool,
{
    let start = clock.millis();
    loop {
        watchdog.service();
        if done() {
            return true;
        }
        if clock.millis().wrapping_sub(start) > timeout_ms {
            return false;
        }
    }
}

/// Poll `done` until it returns `true` or `timeout` fine ticks elapse.
///
/// Returns `true` if the condition was met before the deadline.
pub fn poll_ticks_until<C, W, F>(counter: &C, watchdog: &W, timeout: u16, mut done: F) -> bool
where
    C: FineCounter + ?Sized,
    W: Watchdog + ?Sized,
    F: FnMut() -> bool,
{
    let start = counter.ticks();
    loop {
        watchdog.service();
        if done() {
            return true;
        }
        if counter.ticks().wrapping_sub(start) >= timeout {
            return false;
        }
    }
}

/// Busy-wait for at least `us` microseconds on the fine counter.
pub fn delay_us<C, W>(counter: &C, watchdog: &W, us: u32)
where
    C: FineCounter + ?Sized,
    W: Watchdog + ?Sized,
{
    let ticks = us_to_ticks(us);
    if ticks > 0 {
        poll_ticks_until(counter, watchdog, ticks, || false);
    }
}

/// Convert microseconds to fine ticks, rounding up and saturating.
pub fn us_to_ticks(us: u32) -> u16 {
    let ticks = us.div_ceil(crate::hal::FINE_TICK_US);
    u16::try_from(ticks).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{CountingWatchdog, MockClock};

    #[test]
    fn test_poll_until_condition_met() {
        let clock = MockClock::stepping(1, 0);
        let wd = CountingWatchdog::default();
        let mut calls = 0;
        let ok = poll_until(&clock, &wd, 100, || {
            calls += 1;
            calls == 3
        });
        assert!(ok);
        assert_eq!(wd.count.get(), 3);
    }

    #[test]
    fn test_poll_until_times_out_and_services_watchdog() {
        let clock = MockClock::stepping(1, 0);
        let wd = CountingWatchdog::default();
        assert!(!poll_until(&clock, &wd, 10, || false));
        assert!(wd.count.get() >= 10);
    }

    #[test]
    fn test_poll_until_survives_wraparound() {
        let clock = MockClock::stepping(1, 0);
        clock.ms.set(u32::MAX - 2);
        let wd = CountingWatchdog::default();
        assert!(!poll_until(&clock, &wd, 5, || false));
        // Deadline honoured across the wrap, not returned immediately.
        assert!(wd.count.get() >= 5);
    }

    #[test]
    fn test_poll_ticks_until_times_out() {
        let clock = MockClock::stepping(0, 1);
        let wd = CountingWatchdog::default();
        assert!(!poll_ticks_until(&clock, &wd, 20, || false));
        assert!(clock.ticks.get() >= 20);
    }

    #[test]
    fn test_us_to_ticks_rounds_up() {
        assert_eq!(us_to_ticks(0), 0);
        assert_eq!(us_to_ticks(1), 1);
        assert_eq!(us_to_ticks(10), 1);
        assert_eq!(us_to_ticks(11), 2);
        assert_eq!(us_to_ticks(u32::MAX), u16::MAX);
    }

    #[test]
    fn test_delay_waits_full_period() {
        let clock = MockClock::stepping(0, 1);
        let wd = CountingWatchdog::default();
        delay_us(&clock, &wd, 100);
        assert!(clock.ticks.get() >= 10);
    }
}
