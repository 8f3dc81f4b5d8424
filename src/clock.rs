//! Millisecond clocks derived from the Posix `clock_gettime` family.
//!
//! The runtime keeps all deadlines in monotonic milliseconds:
//! - [`monotonic_ms()`] - monotonic time, the timer queue's time source
//! - [`realtime_ms()`] - wall clock time, used only for log records
//!
//! Monotonic time is not affected by NTP adjustments or by changes done by
//! an administrator, which makes it the right base for timeouts.

/// Sentinel meaning "no deadline".
pub const INFINITE_MS: u64 = u64::MAX;

#[inline]
fn clock_ms(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime only fails for an invalid clock id.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Milliseconds since boot, `clock_gettime(CLOCK_MONOTONIC)`.
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    clock_ms(libc::CLOCK_MONOTONIC)
}

/// Milliseconds since the epoch, `clock_gettime(CLOCK_REALTIME)`.
#[inline(always)]
pub fn realtime_ms() -> u64 {
    clock_ms(libc::CLOCK_REALTIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn realtime_is_past_2020() {
        assert!(realtime_ms() > 1_577_836_800_000);
    }
}
