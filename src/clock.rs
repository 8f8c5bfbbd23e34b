//! Wall-clock and monotonic time sources.
//!
//! Most functions here return a number of seconds as `f64`; functions with
//! names followed by `64` return a 64-bit integer number of nanoseconds. The
//! scheduler and timer heap use [`now_ms`] internally, which is the
//! millisecond-resolution monotonic source the rest of this crate's deadline
//! arithmetic is built on.
//!
//! - [`time`] / [`time64`] - wall clock time (`CLOCK_REALTIME`)
//! - [`monotonic`] / [`monotonic64`] - monotonic time (`CLOCK_MONOTONIC`)
//! - [`process`] / [`process64`] - process CPU time (`CLOCK_PROCESS_CPUTIME_ID`)
//! - [`thread`] / [`thread64`] - thread CPU time (`CLOCK_THREAD_CPUTIME_ID`)

use std::time::Duration;

/// A deadline far enough in the future to stand in for "never".
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Sentinel deadline value meaning "no deadline, wait forever".
pub const NO_DEADLINE: i64 = -1;

fn clock_gettime_ns(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime failed: {}", std::io::Error::last_os_error());
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The wall clock time in seconds since the epoch (1970-01-01 00:00:00).
#[inline]
pub fn time() -> f64 {
    time64() as f64 / 1e9
}

/// The wall clock time in nanoseconds since the epoch.
#[inline]
pub fn time64() -> u64 {
    clock_gettime_ns(libc::CLOCK_REALTIME)
}

/// The monotonic time in seconds since an unspecified starting point.
///
/// Unaffected by wall-clock adjustments; this is what deadline arithmetic
/// throughout the scheduler is built on.
#[inline]
pub fn monotonic() -> f64 {
    monotonic64() as f64 / 1e9
}

/// The monotonic time in nanoseconds. See [`monotonic`].
#[inline]
pub fn monotonic64() -> u64 {
    clock_gettime_ns(libc::CLOCK_MONOTONIC)
}

/// The process CPU time in seconds.
#[inline]
pub fn process() -> f64 {
    process64() as f64 / 1e9
}

/// The process CPU time in nanoseconds. See [`process`].
#[inline]
pub fn process64() -> u64 {
    clock_gettime_ns(libc::CLOCK_PROCESS_CPUTIME_ID)
}

/// The calling thread's CPU time in seconds.
#[inline]
pub fn thread() -> f64 {
    thread64() as f64 / 1e9
}

/// The calling thread's CPU time in nanoseconds. See [`thread`].
#[inline]
pub fn thread64() -> u64 {
    clock_gettime_ns(libc::CLOCK_THREAD_CPUTIME_ID)
}

/// Monotonic time in milliseconds, the unit timers and deadlines throughout
/// this crate are expressed in.
#[inline]
pub fn now_ms() -> i64 {
    (monotonic64() / 1_000_000) as i64
}

/// Convert a `Duration` from now into an absolute deadline in monotonic
/// milliseconds, as accepted by `sleep`, `fdwait`, `select` and friends.
#[inline]
pub fn deadline_from(timeout: Duration) -> i64 {
    now_ms().saturating_add(timeout.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn deadline_from_is_in_the_future() {
        let d = deadline_from(Duration::from_millis(50));
        assert!(d >= now_ms());
    }
}
