//! Monotonic microsecond clock.

use nix::time::{ClockId, clock_gettime};

/// Microseconds on the monotonic clock.
///
/// Only differences between two readings are meaningful. Returns zero if
/// the clock cannot be read, which no supported platform does.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn monotonic_micros() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC).map_or(0, |ts| {
        ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000
    })
}

/// Microseconds elapsed since an earlier [`monotonic_micros`] reading.
#[must_use]
pub fn elapsed_micros(start: u64) -> u64 {
    monotonic_micros().saturating_sub(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_clock_advances() {
        let start = monotonic_micros();
        thread::sleep(Duration::from_millis(5));
        assert!(elapsed_micros(start) >= 5_000);
    }
}
