// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic-nanosecond timestamps shared across process boundaries.
//!
//! Heartbeats and drain deadlines stored in the header are compared
//! across processes, so they need a clock that is consistent system-wide,
//! not merely within one process. `std::time::Instant` happens to be
//! backed by `CLOCK_MONOTONIC` on Linux but doesn't expose a raw
//! nanosecond count, so this calls `clock_gettime` directly via `libc`
//! (already a dependency for the `shm_open`/`mmap` calls in
//! [`crate::segment`]).

/// Current value of `CLOCK_MONOTONIC`, in nanoseconds.
#[must_use]
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, appropriately-sized out parameter;
    // CLOCK_MONOTONIC is supported on every platform this crate targets.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now_ns();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_now_ns();
        assert!(b > a);
    }
}
