//! Time values derived from the POSIX `clock_gettime` function.
//!
//! The timer wheel runs on [`monotonic_ms`], a coarse millisecond clock that
//! is cheap to read and immune to wall-clock adjustments. The fine-grained
//! variants are provided for benchmarks and diagnostics.

use crate::log::fatal;

fn gettime(clock_id: libc::clockid_t) -> libc::timespec {
    let mut t = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock_id, &mut t) } < 0 {
        fatal!(
            "`clock_gettime()` failed: {}",
            std::io::Error::last_os_error()
        );
    }
    t
}

/// The monotonic time in milliseconds, from `CLOCK_MONOTONIC_COARSE`.
///
/// Resolution is a kernel tick (typically 1–4 ms), which is all the timer
/// needs and considerably cheaper than the precise clock.
#[inline]
pub fn monotonic_ms() -> u64 {
    let t = gettime(libc::CLOCK_MONOTONIC_COARSE);
    t.tv_sec as u64 * 1000 + t.tv_nsec as u64 / 1_000_000
}

/// The monotonic time in seconds, from `CLOCK_MONOTONIC`.
#[inline]
pub fn monotonic() -> f64 {
    let t = gettime(libc::CLOCK_MONOTONIC);
    t.tv_sec as f64 + t.tv_nsec as f64 / 1e9
}

/// The monotonic time in nanoseconds, from `CLOCK_MONOTONIC`.
#[inline]
pub fn monotonic64() -> u64 {
    let t = gettime(libc::CLOCK_MONOTONIC);
    t.tv_sec as u64 * 1_000_000_000 + t.tv_nsec as u64
}
