//! Monotonic clock helpers.
//!
//! All timer deadlines in this crate are milliseconds on the monotonic
//! clock; wall-clock time is only used for load-balancer statistics
//! bucketing.
use std::mem::MaybeUninit;

fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    unsafe {
        libc::clock_gettime(clock, ts.as_mut_ptr());
        ts.assume_init()
    }
}

/// Monotonic time in milliseconds.
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Monotonic time in microseconds.
#[inline(always)]
pub fn monotonic_us() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1000
}

/// Monotonic time as seconds.
#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// Wall-clock time in whole seconds.
#[inline(always)]
pub fn realtime_s() -> u64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b >= a + 4);
    }

    #[test]
    fn units_agree() {
        let us = monotonic_us();
        let ms = monotonic_ms();
        assert!(ms <= us / 1000 + 2);
    }
}
