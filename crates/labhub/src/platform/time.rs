// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic clock readable across processes.
//!
//! Heartbeats and spinlock timestamps are compared between processes, so
//! `std::time::Instant` (whose origin is process-local on some platforms)
//! is not usable here; we read `CLOCK_MONOTONIC` directly.

/// Current monotonic time in nanoseconds.
///
/// The origin is boot-time-ish and shared by every process on the host,
/// which is what makes cross-process heartbeat age comparisons valid.
#[must_use]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec; CLOCK_MONOTONIC is always
    // available on the supported platforms. clock_gettime only writes ts.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(ret, 0);
    (ts.tv_sec as u64).wrapping_mul(1_000_000_000) + ts.tv_nsec as u64
}
