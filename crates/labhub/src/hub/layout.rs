// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segment layout constants — the ABI contract.
//!
//! ```text
//! offset 0                          : header (4096 B, page aligned)
//! offset 4096                       : flexible zone (flex B, 64-B multiple)
//! offset 4096 + flex                : slot payloads [0..N)  (slot_size B each)
//! offset align64(4096+flex+N*ss)    : slot states  [0..N)  (128 B each)
//! ```
//!
//! Every bound here is fixed for major version 1. Changing any constant,
//! field order, or alignment is a major-version ABI break; the static
//! assertions in the sibling modules pin the struct layouts to these
//! numbers.

/// Segment magic, first 8 bytes of every channel.
pub const MAGIC: [u8; 8] = *b"PYLBHUB\0";

/// ABI major version. Attach requires an exact match.
pub const VERSION_MAJOR: u16 = 1;

/// ABI minor version. Informational; never gates attach.
pub const VERSION_MINOR: u16 = 0;

/// Header size in bytes, exactly one page.
pub const HEADER_SIZE: usize = 4096;

/// Consumer heartbeat pool bound.
pub const MAX_CONSUMER_HEARTBEATS: usize = 8;

/// Shared spinlock pool bound.
pub const MAX_SHARED_SPINLOCKS: usize = 8;

/// Bytes per heartbeat entry.
pub const HEARTBEAT_ENTRY_SIZE: usize = 24;

/// Bytes per spinlock state.
pub const SPINLOCK_STATE_SIZE: usize = 48;

/// Bytes per slot state (two cache lines).
pub const SLOT_STATE_SIZE: usize = 128;

/// Alignment unit for the flexible zone and the slot state array.
pub const CACHE_LINE: usize = 64;

/// Spinlock pool index guarding flexible-zone checksum updates.
pub const LOCK_FLEX_ZONE: usize = 0;

/// Spinlock pool index serialising recovery operations.
pub const LOCK_RECOVERY: usize = 1;

/// Round `n` up to the next multiple of [`CACHE_LINE`].
#[must_use]
pub const fn align_up(n: u64) -> u64 {
    let line = CACHE_LINE as u64;
    n.div_ceil(line) * line
}

/// Offset of the flexible zone.
#[must_use]
pub const fn flex_zone_offset() -> u64 {
    HEADER_SIZE as u64
}

/// Offset of slot payload `phys` for the given geometry.
#[must_use]
pub const fn slot_payload_offset(flex_size: u64, slot_size: u64, phys: u64) -> u64 {
    flex_zone_offset() + flex_size + slot_size * phys
}

/// Offset of the slot state array.
#[must_use]
pub const fn slot_states_offset(flex_size: u64, slot_size: u64, slot_count: u64) -> u64 {
    align_up(flex_zone_offset() + flex_size + slot_size * slot_count)
}

/// Total segment size for the given geometry.
#[must_use]
pub const fn total_segment_size(flex_size: u64, slot_size: u64, slot_count: u64) -> u64 {
    slot_states_offset(flex_size, slot_size, slot_count) + slot_count * SLOT_STATE_SIZE as u64
}
