// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth for tuning knobs.
//!
//! Two levels:
//!
//! - **Static**: compile-time defaults for every knob.
//! - **Dynamic**: [`RuntimeTuning`] snapshot, overridable from `LABHUB_*`
//!   environment variables and swappable at runtime without locks
//!   (`ArcSwap`, same discipline as the port-mapping config).
//!
//! Readers grab an `Arc` snapshot once per operation; they never observe a
//! half-updated set of knobs.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::OnceLock;

/// Max time a writer waits for readers to drain before it may evict zombies.
pub const DEFAULT_WRITER_PATIENCE_NS: u64 = 1_000_000; // 1 ms

/// Heartbeat age beyond which a reader is declared zombie.
pub const DEFAULT_READER_TIMEOUT_NS: u64 = 5_000_000_000; // 5 s

/// Default for blocking acquires when the caller does not pass a timeout.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: i64 = 100;

/// Spin iterations before the backoff starts sleeping.
pub const DEFAULT_BACKOFF_SPIN_ITERS: u32 = 4;

/// First sleep step of the backoff, in microseconds.
pub const DEFAULT_BACKOFF_SHORT_US: u64 = 1;

/// Multiplier bounding the longest backoff sleep (`iter * multiplier` us).
pub const DEFAULT_BACKOFF_LONG_MULTIPLIER: u64 = 10;

/// Spinlock holder age beyond which a takeover is allowed.
pub const DEFAULT_SPINLOCK_STALE_NS: u64 = 1_000_000_000; // 1 s

/// Runtime tuning snapshot.
///
/// Loaded once from the environment at first use; replaceable as a whole via
/// [`set_tuning`]. Individual fields are never mutated in place.
#[derive(Clone, Debug)]
pub struct RuntimeTuning {
    /// Max writer wait for readers, nanoseconds (`LABHUB_WRITER_PATIENCE_NS`)
    pub writer_patience_ns: u64,
    /// Reader heartbeat timeout, nanoseconds (`LABHUB_READER_TIMEOUT_NS`)
    pub reader_timeout_ns: u64,
    /// Default blocking-acquire timeout, ms (`LABHUB_ACQUIRE_TIMEOUT_MS`)
    pub acquire_default_timeout_ms: i64,
    /// Spin iterations before sleeping (`LABHUB_BACKOFF_SPIN_ITERS`)
    pub backoff_spin_iters: u32,
    /// Shortest backoff sleep, us (`LABHUB_BACKOFF_SHORT_US`)
    pub backoff_short_us: u64,
    /// Longest-sleep multiplier (`LABHUB_BACKOFF_LONG_MULTIPLIER`)
    pub backoff_long_multiplier: u64,
    /// Gate for attach-time schema hash checks (`LABHUB_SCHEMA_VALIDATION`)
    pub schema_validation: bool,
    /// Spinlock stale-holder bound, nanoseconds (`LABHUB_SPINLOCK_STALE_NS`)
    pub spinlock_stale_ns: u64,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            writer_patience_ns: DEFAULT_WRITER_PATIENCE_NS,
            reader_timeout_ns: DEFAULT_READER_TIMEOUT_NS,
            acquire_default_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            backoff_spin_iters: DEFAULT_BACKOFF_SPIN_ITERS,
            backoff_short_us: DEFAULT_BACKOFF_SHORT_US,
            backoff_long_multiplier: DEFAULT_BACKOFF_LONG_MULTIPLIER,
            schema_validation: true,
            spinlock_stale_ns: DEFAULT_SPINLOCK_STALE_NS,
        }
    }
}

impl RuntimeTuning {
    /// Build a snapshot from defaults overridden by `LABHUB_*` environment
    /// variables. Unparseable values fall back to the default silently;
    /// tuning must never abort startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut t = Self::default();
        t.writer_patience_ns = env_u64("LABHUB_WRITER_PATIENCE_NS", t.writer_patience_ns);
        t.reader_timeout_ns = env_u64("LABHUB_READER_TIMEOUT_NS", t.reader_timeout_ns);
        t.acquire_default_timeout_ms =
            env_i64("LABHUB_ACQUIRE_TIMEOUT_MS", t.acquire_default_timeout_ms);
        t.backoff_spin_iters = env_u64("LABHUB_BACKOFF_SPIN_ITERS", u64::from(t.backoff_spin_iters))
            as u32;
        t.backoff_short_us = env_u64("LABHUB_BACKOFF_SHORT_US", t.backoff_short_us);
        t.backoff_long_multiplier =
            env_u64("LABHUB_BACKOFF_LONG_MULTIPLIER", t.backoff_long_multiplier);
        t.schema_validation = env_switch("LABHUB_SCHEMA_VALIDATION", t.schema_validation);
        t.spinlock_stale_ns = env_u64("LABHUB_SPINLOCK_STALE_NS", t.spinlock_stale_ns);
        t
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_switch(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim(), "on" | "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn store() -> &'static ArcSwap<RuntimeTuning> {
    static STORE: OnceLock<ArcSwap<RuntimeTuning>> = OnceLock::new();
    STORE.get_or_init(|| ArcSwap::from_pointee(RuntimeTuning::from_env()))
}

/// Current tuning snapshot. Cheap; safe to call per operation.
#[must_use]
pub fn tuning() -> Arc<RuntimeTuning> {
    store().load_full()
}

/// Replace the process-wide tuning snapshot.
pub fn set_tuning(t: RuntimeTuning) {
    store().store(Arc::new(t));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = RuntimeTuning::default();
        assert_eq!(t.writer_patience_ns, 1_000_000);
        assert_eq!(t.reader_timeout_ns, 5_000_000_000);
        assert_eq!(t.acquire_default_timeout_ms, 100);
        assert_eq!(t.backoff_spin_iters, 4);
        assert!(t.schema_validation);
    }

    #[test]
    fn test_set_and_load_tuning() {
        let before = tuning();
        let mut t = (*before).clone();
        t.writer_patience_ns = 42;
        set_tuning(t);
        assert_eq!(tuning().writer_patience_ns, 42);
        // Restore defaults for other tests in the same process
        set_tuning((*before).clone());
    }
}
