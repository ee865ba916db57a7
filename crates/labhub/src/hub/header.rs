// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The 4096-byte channel header.
//!
//! Lives at offset 0 of every segment. Identity and config fields are
//! written once at format time, before any consumer can attach; state,
//! metric, and heartbeat fields are atomics mutated for the life of the
//! channel.
//!
//! # Memory Ordering
//!
//! `write_index` is the publication point of the writer protocol: the store
//! is Release and every consumer load is Acquire, so a consumer that
//! observes index `k+1` also observes the committed slot state and payload
//! for id `k`. Metrics are Relaxed; they are monitoring data, not
//! synchronisation.

use super::layout::{
    HEADER_SIZE, HEARTBEAT_ENTRY_SIZE, MAGIC, MAX_CONSUMER_HEARTBEATS, MAX_SHARED_SPINLOCKS,
    VERSION_MAJOR, VERSION_MINOR,
};
use super::spinlock::SpinlockState;
use crate::hash::ContentHash;
use crate::platform::{is_pid_alive, monotonic_ns};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Ring-buffer channel policy tag (the only policy in major version 1).
pub const POLICY_RING_BUFFER: u32 = 1;

/// Header flag: schema hashes are populated.
pub const HEADER_FLAG_HAS_SCHEMAS: u32 = 1;

/// One heartbeat slot: (pid, last monotonic ns, in-use).
///
/// Claimed by CAS on `pid` — the pid is the ownership token, `in_use`
/// mirrors it for scanners.
#[repr(C)]
pub struct HeartbeatEntry {
    /// Owning pid, 0 when free
    pub pid: AtomicU64,
    /// Monotonic ns of the owner's last operation
    pub last_ns: AtomicU64,
    /// 1 while the entry is allocated
    pub in_use: AtomicU32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<HeartbeatEntry>() == HEARTBEAT_ENTRY_SIZE);

impl HeartbeatEntry {
    /// Try to claim this entry for `pid`. The CAS on `pid` is the ownership
    /// decision; losers move on to the next entry.
    pub fn try_claim(&self, pid: u64) -> bool {
        if self
            .pid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.last_ns.store(monotonic_ns(), Ordering::Release);
        self.in_use.store(1, Ordering::Release);
        true
    }

    /// Refresh the heartbeat. Called on every acquire/commit/release by the
    /// owner.
    pub fn beat(&self) {
        self.last_ns.store(monotonic_ns(), Ordering::Release);
    }

    /// Release the entry back to the pool.
    pub fn release(&self) {
        self.in_use.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    /// True when allocated (owner pid recorded).
    pub fn is_claimed(&self) -> bool {
        self.pid.load(Ordering::Acquire) != 0
    }

    /// Zombie test: allocated, and the owner is dead or its heartbeat is
    /// older than `timeout_ns`.
    pub fn is_zombie(&self, now_ns: u64, timeout_ns: u64) -> bool {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        if !is_pid_alive(pid) {
            return true;
        }
        now_ns.saturating_sub(self.last_ns.load(Ordering::Acquire)) > timeout_ns
    }

    /// Free the entry if its owner is dead. Returns the reclaimed pid.
    pub fn reclaim_if_dead(&self) -> Option<u64> {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 || is_pid_alive(pid) {
            return None;
        }
        if self
            .pid
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.in_use.store(0, Ordering::Release);
            return Some(pid);
        }
        None
    }
}

/// Channel header, exactly [`HEADER_SIZE`] bytes at segment offset 0.
///
/// Field order, widths, and every array bound are part of the version-1 ABI.
#[repr(C, align(4096))]
pub struct HubHeader {
    // --- identity ---
    pub(crate) magic: [u8; 8],
    pub(crate) version_major: u16,
    pub(crate) version_minor: u16,
    _pad0: u32,
    pub(crate) total_size: u64,

    // --- security ---
    pub(crate) shared_secret: u64,
    pub(crate) flexzone_schema_hash: [u8; 32],
    pub(crate) datablock_schema_hash: [u8; 32],
    pub(crate) schema_version: u16,
    _pad1: [u8; 6],

    // --- config ---
    pub(crate) policy: u32,
    pub(crate) flags: u32,
    pub(crate) slot_count: u64,
    pub(crate) slot_size: u64,
    pub(crate) flexible_zone_size: u64,

    // --- state ---
    pub(crate) write_index: AtomicU64,
    pub(crate) read_index_hint: AtomicU64,
    pub(crate) generation: AtomicU64,

    // --- metrics ---
    pub(crate) writes: AtomicU64,
    pub(crate) overruns: AtomicU64,
    pub(crate) acquire_failures: AtomicU64,
    pub(crate) integrity_failures: AtomicU64,

    // --- heartbeats ---
    pub(crate) producer_heartbeat: HeartbeatEntry,
    pub(crate) consumer_heartbeats: [HeartbeatEntry; MAX_CONSUMER_HEARTBEATS],

    // --- spinlocks ---
    pub(crate) spinlocks: [SpinlockState; MAX_SHARED_SPINLOCKS],

    // --- flexible zone checksum (seqlock-free: guarded by LOCK_FLEX_ZONE) ---
    pub(crate) flexzone_checksum: UnsafeCell<[u8; 32]>,

    _reserved: [u8; 3272],
}

const _: () = assert!(std::mem::size_of::<HubHeader>() == HEADER_SIZE);
const _: () = assert!(std::mem::align_of::<HubHeader>() == HEADER_SIZE);

// SAFETY: the header lives in shared memory and is accessed from many
// threads and processes; every mutable field is atomic except
// flexzone_checksum, whose access is serialised by the LOCK_FLEX_ZONE
// spinlock.
unsafe impl Sync for HubHeader {}

/// Everything `format` needs to stamp a fresh header.
pub(crate) struct FormatParams {
    pub total_size: u64,
    pub shared_secret: u64,
    pub flexzone_schema_hash: ContentHash,
    pub datablock_schema_hash: ContentHash,
    pub schema_version: u16,
    pub slot_count: u64,
    pub slot_size: u64,
    pub flexible_zone_size: u64,
}

impl HubHeader {
    /// Names stamped onto the well-known spinlocks at format time.
    const LOCK_NAMES: [&'static str; 2] = ["flexzone", "recovery"];

    /// Stamp a freshly created (all-zero) header.
    ///
    /// Exclusive access is guaranteed by the caller: the segment was just
    /// created and no consumer can know its secret yet.
    pub(crate) fn format(&mut self, p: &FormatParams) {
        self.magic = MAGIC;
        self.version_major = VERSION_MAJOR;
        self.version_minor = VERSION_MINOR;
        self.total_size = p.total_size;
        self.shared_secret = p.shared_secret;
        self.flexzone_schema_hash = *p.flexzone_schema_hash.as_bytes();
        self.datablock_schema_hash = *p.datablock_schema_hash.as_bytes();
        self.schema_version = p.schema_version;
        self.policy = POLICY_RING_BUFFER;
        self.flags = if p.flexzone_schema_hash.is_zero() && p.datablock_schema_hash.is_zero() {
            0
        } else {
            HEADER_FLAG_HAS_SCHEMAS
        };
        self.slot_count = p.slot_count;
        self.slot_size = p.slot_size;
        self.flexible_zone_size = p.flexible_zone_size;

        for (i, name) in Self::LOCK_NAMES.iter().enumerate() {
            let bytes = name.as_bytes();
            self.spinlocks[i].debug_name[..bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Magic check; the first gate of every attach.
    pub(crate) fn magic_ok(&self) -> bool {
        self.magic == MAGIC
    }

    /// `(major, minor)` as stored.
    pub fn version(&self) -> (u16, u16) {
        (self.version_major, self.version_minor)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn slot_count(&self) -> u64 {
        self.slot_count
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn flexible_zone_size(&self) -> u64 {
        self.flexible_zone_size
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    pub fn stored_flexzone_schema_hash(&self) -> ContentHash {
        ContentHash::from_bytes(self.flexzone_schema_hash)
    }

    pub fn stored_datablock_schema_hash(&self) -> ContentHash {
        ContentHash::from_bytes(self.datablock_schema_hash)
    }

    /// Spinlock by pool index.
    pub(crate) fn spinlock(&self, index: usize) -> &SpinlockState {
        &self.spinlocks[index]
    }

    /// Read the stored flexible-zone checksum.
    ///
    /// Callers that need a consistent value against concurrent updates must
    /// hold `LOCK_FLEX_ZONE`.
    pub(crate) fn flexzone_checksum(&self) -> ContentHash {
        // SAFETY: plain 32-byte read; consistency is the caller's business
        // per the locking contract above.
        ContentHash::from_bytes(unsafe { *self.flexzone_checksum.get() })
    }

    /// Store the flexible-zone checksum. Producer only, under
    /// `LOCK_FLEX_ZONE`.
    pub(crate) fn set_flexzone_checksum(&self, hash: &ContentHash) {
        // SAFETY: serialised by the flex-zone spinlock held by the caller.
        unsafe {
            *self.flexzone_checksum.get() = *hash.as_bytes();
        }
    }
}
