// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named spinlocks embedded in the channel header.
//!
//! The pool is the only contended primitive in shared memory and is kept off
//! the hot slot path; current users are the flexible-zone checksum update
//! and recovery serialisation.
//!
//! Acquisition records the holder pid and a monotonic timestamp. A holder
//! that is no longer alive, or that has held the lock past the stale bound,
//! is taken over by CAS from the observed value — a crashed process can
//! never wedge the lock for good.

use crate::backoff::Backoff;
use crate::config::RuntimeTuning;
use crate::error::{HubError, Result};
use crate::platform::{current_pid, is_pid_alive, monotonic_ns};
use std::sync::atomic::{AtomicU64, Ordering};

/// One spinlock slot in the header pool.
///
/// # Memory Layout
///
/// ```text
/// Offset  Size  Field
/// 0       8     holder_pid (AtomicU64, 0 = free)
/// 8       8     acquire_ns (AtomicU64)
/// 16      24    debug_name (set at format time)
/// 40      8     _pad
/// ```
#[repr(C)]
pub struct SpinlockState {
    /// Current holder, 0 when free
    pub holder_pid: AtomicU64,
    /// Monotonic timestamp of the last successful acquire
    pub acquire_ns: AtomicU64,
    /// Human-readable lock name, NUL padded
    pub debug_name: [u8; 24],
    _pad: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<SpinlockState>() == super::layout::SPINLOCK_STATE_SIZE);

impl SpinlockState {
    /// Fresh unlocked state (off-segment use in tests).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            holder_pid: AtomicU64::new(0),
            acquire_ns: AtomicU64::new(0),
            debug_name: [0u8; 24],
            _pad: [0u8; 8],
        }
    }

    /// The debug name up to the first NUL.
    #[must_use]
    pub fn name(&self) -> &str {
        let end = self
            .debug_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.debug_name.len());
        std::str::from_utf8(&self.debug_name[..end]).unwrap_or("")
    }

    /// Acquire the lock, waiting at most `timeout_ns` (`None` = forever).
    ///
    /// Dead or stale holders are taken over; the takeover is logged because
    /// it means a peer crashed or stalled inside a short critical section.
    pub fn acquire(&self, tuning: &RuntimeTuning, timeout_ns: Option<u64>) -> Result<SpinlockGuard<'_>> {
        let me = current_pid();
        let start = monotonic_ns();
        let mut backoff = Backoff::new(tuning);

        loop {
            let holder = self.holder_pid.load(Ordering::Acquire);

            if holder == 0 {
                if self
                    .holder_pid
                    .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.acquire_ns.store(monotonic_ns(), Ordering::Release);
                    return Ok(SpinlockGuard { lock: self, pid: me });
                }
                continue;
            }

            if holder != me {
                let now = monotonic_ns();
                let held_ns = now.saturating_sub(self.acquire_ns.load(Ordering::Acquire));
                if !is_pid_alive(holder) || held_ns > tuning.spinlock_stale_ns {
                    if self
                        .holder_pid
                        .compare_exchange(holder, me, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        log::warn!(
                            "[SPINLOCK] took over '{}' from pid {} (held {} ns)",
                            self.name(),
                            holder,
                            held_ns
                        );
                        self.acquire_ns.store(monotonic_ns(), Ordering::Release);
                        return Ok(SpinlockGuard { lock: self, pid: me });
                    }
                    continue;
                }
            }

            if let Some(t) = timeout_ns {
                if monotonic_ns().saturating_sub(start) >= t {
                    return Err(HubError::Busy(format!(
                        "spinlock '{}' held by pid {holder}",
                        self.name()
                    )));
                }
            }
            backoff.snooze();
        }
    }
}

impl Default for SpinlockState {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped lock ownership; releases on every exit path.
pub struct SpinlockGuard<'a> {
    lock: &'a SpinlockState,
    pid: u64,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        // Normal path: we still hold it. A failed CAS means a takeover
        // evicted us mid-section; the lock state is already suspect, so
        // clear it unconditionally rather than leave a phantom holder.
        if self
            .lock
            .holder_pid
            .compare_exchange(self.pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!(
                "[SPINLOCK] release of '{}' found foreign holder (we were evicted)",
                self.lock.name()
            );
            self.lock.holder_pid.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    fn tuning() -> RuntimeTuning {
        RuntimeTuning::default()
    }

    #[test]
    fn test_state_size() {
        assert_eq!(std::mem::size_of::<SpinlockState>(), 48);
    }

    #[test]
    fn test_acquire_release() {
        let lock = SpinlockState::new();
        {
            let _guard = lock.acquire(&tuning(), Some(1_000_000)).expect("acquire");
            assert_eq!(lock.holder_pid.load(Ordering::Acquire), current_pid());
        }
        assert_eq!(lock.holder_pid.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_acquire_timeout_while_held_by_fake_live_holder() {
        let lock = SpinlockState::new();
        // Pretend pid 1 (init, always alive) freshly holds the lock.
        lock.holder_pid.store(1, Ordering::Release);
        lock.acquire_ns.store(monotonic_ns(), Ordering::Release);

        let result = lock.acquire(&tuning(), Some(2_000_000));
        assert!(matches!(result, Err(HubError::Busy(_))));
    }

    #[test]
    fn test_zombie_takeover() {
        let lock = SpinlockState::new();
        // A pid far above pid_max is never alive.
        lock.holder_pid.store(u64::from(u32::MAX), Ordering::Release);
        lock.acquire_ns.store(monotonic_ns(), Ordering::Release);

        let guard = lock.acquire(&tuning(), Some(100_000_000)).expect("takeover");
        assert_eq!(lock.holder_pid.load(Ordering::Acquire), current_pid());
        drop(guard);
    }

    #[test]
    fn test_stale_takeover() {
        let mut t = tuning();
        t.spinlock_stale_ns = 1; // anything counts as stale
        let lock = SpinlockState::new();
        lock.holder_pid.store(1, Ordering::Release);
        lock.acquire_ns
            .store(monotonic_ns().saturating_sub(1_000_000), Ordering::Release);

        let guard = lock.acquire(&t, Some(100_000_000)).expect("stale takeover");
        drop(guard);
    }

    #[test]
    fn test_contention_is_exclusive() {
        let lock = Arc::new(SpinlockState::new());
        let inside = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let _guard = lock.acquire(&RuntimeTuning::default(), None).expect("acquire");
                    let now = inside.fetch_add(1, Ordering::AcqRel);
                    assert_eq!(now, 0, "two holders inside the critical section");
                    inside.fetch_sub(1, Ordering::AcqRel);
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }
    }
}
