//! Clock helpers. All timestamps in the crate are `CLOCK_MONOTONIC`
//! nanoseconds, the same domain V4L2 uses for its buffer timestamps.

pub const NS_PER_MS: i64 = 1_000_000;
pub const NS_PER_SEC: i64 = 1_000_000_000;

fn clock_ns(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer for the duration of the call.
    let ret = unsafe { libc::clock_gettime(clock, &mut ts) };
    if ret != 0 {
        return 0;
    }
    ts.tv_sec as i64 * NS_PER_SEC + ts.tv_nsec as i64
}

pub fn monotonic_ns() -> i64 {
    clock_ns(libc::CLOCK_MONOTONIC)
}

pub fn realtime_ns() -> i64 {
    clock_ns(libc::CLOCK_REALTIME)
}

pub fn ns_to_s(ns: i64) -> f64 {
    ns as f64 / NS_PER_SEC as f64
}

/// A `timeval` split into seconds and microseconds.
pub fn timeval_to_ns(sec: i64, usec: i64) -> i64 {
    sec * NS_PER_SEC + usec * 1000
}
