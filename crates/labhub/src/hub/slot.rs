// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-slot coordination state.
//!
//! One [`SlotState`] per ring slot, in an array at the tail of the segment.
//! The `sequence` field is a seqlock: even while the slot is free or
//! committed, odd while the single producer holds it for writing.
//!
//! # State Machine
//!
//! ```text
//! Empty(seq=0) / Committed(seq=2k)  --CAS seq -> seq+1-->  Writing(seq odd)
//! Writing                           --commit: CAS +1-->    Committed(seq=2k+2)
//! Writing                           --abort:  CAS -1-->    previous state
//! ```
//!
//! # Memory Ordering
//!
//! - **Release** on the commit CAS: payload bytes and checksum must be
//!   visible before the even sequence value is.
//! - **Acquire** on every sequence load that gates payload access.
//! - Reader admission is `fetch_add(readers)` followed by a re-check of
//!   `sequence` and `slot_id`; a slot overwritten between the sample and the
//!   grab fails the re-check and the count is rolled back.
//!
//! The 64-bit `slot_id` (monotonic commit number) is what distinguishes two
//! commits that landed in the same physical slot after a ring wrap; readers
//! never reason about wall time.

use super::layout::SLOT_STATE_SIZE;
use crate::hash::ContentHash;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Slot flag: the last validation of this slot's payload failed its
/// checksum while the sequence was stable (true corruption, not overwrite).
pub const SLOT_FLAG_INTEGRITY_FAILED: u32 = 1;

/// Coordination state for one ring slot.
///
/// # Memory Layout
///
/// ```text
/// Offset  Size  Field
/// 0       8     sequence (AtomicU64, odd = writing)
/// 8       8     slot_id (AtomicU64, id of last commit)
/// 16      4     readers (AtomicU32)
/// 20      4     flags (AtomicU32)
/// 24      8     writer_pid (AtomicU64)
/// 32      8     write_ns (AtomicU64)
/// 40      32    checksum (BLAKE2b-256 of payload as committed)
/// 72      56    _pad (to two cache lines)
/// ```
#[repr(C, align(64))]
pub struct SlotState {
    /// Seqlock word
    pub sequence: AtomicU64,
    /// Monotonic id of the last commit into this physical slot
    pub slot_id: AtomicU64,
    /// Active reader count
    pub readers: AtomicU32,
    /// Status bits
    pub flags: AtomicU32,
    /// Pid of the writer holding or last holding the slot
    pub writer_pid: AtomicU64,
    /// Monotonic ns of the last write acquisition
    pub write_ns: AtomicU64,
    /// Payload digest; written only while `sequence` is odd
    checksum: UnsafeCell<[u8; 32]>,
    _pad: [u8; 56],
}

const _: () = assert!(std::mem::size_of::<SlotState>() == SLOT_STATE_SIZE);
const _: () = assert!(std::mem::align_of::<SlotState>() == 64);

// SAFETY: shared across threads/processes; all fields are atomic except
// `checksum`, which is written only while the seqlock word is odd and read
// under the sequence re-check protocol.
unsafe impl Sync for SlotState {}

impl SlotState {
    /// Fresh `Empty` state (off-segment use in tests; segments rely on
    /// zero-initialised mappings).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            slot_id: AtomicU64::new(0),
            readers: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            writer_pid: AtomicU64::new(0),
            write_ns: AtomicU64::new(0),
            checksum: UnsafeCell::new([0u8; 32]),
            _pad: [0u8; 56],
        }
    }

    /// Current sequence word.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// True while a writer holds the slot.
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.sequence() & 1 == 1
    }

    /// True once at least one commit has landed here.
    #[inline]
    pub fn is_committed(&self) -> bool {
        let seq = self.sequence();
        seq != 0 && seq & 1 == 0
    }

    /// Writer entry: CAS the observed even sequence to odd.
    ///
    /// Returns the previous even value on success. `None` means the word
    /// moved under us — with a single producer that only happens when a
    /// diagnostic tool intervened.
    pub fn try_begin_write(&self) -> Option<u64> {
        let seq = self.sequence.load(Ordering::Acquire);
        if seq & 1 == 1 {
            return None;
        }
        self.sequence
            .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
    }

    /// Commit: publish checksum and slot id, then flip the seqlock even.
    ///
    /// Must be called by the thread that won [`Self::try_begin_write`] with
    /// the value it returned. Returns false if the word was disturbed.
    pub fn commit_write(&self, prev_even: u64, slot_id: u64, checksum: &ContentHash) -> bool {
        // SAFETY: we hold the slot (sequence is odd and only the single
        // producer flips it), so no other party writes the checksum cell.
        unsafe {
            *self.checksum.get() = *checksum.as_bytes();
        }
        self.slot_id.store(slot_id, Ordering::Release);
        self.flags
            .fetch_and(!SLOT_FLAG_INTEGRITY_FAILED, Ordering::AcqRel);
        self.sequence
            .compare_exchange(prev_even + 1, prev_even + 2, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Abort: hand the slot back in its previous state.
    pub fn abort_write(&self, prev_even: u64) -> bool {
        self.sequence
            .compare_exchange(prev_even + 1, prev_even, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reader admission for the expected slot id.
    ///
    /// Returns the admitted sequence on success; the caller must pass it
    /// back to [`Self::still_valid`] / hold it for release-time validation.
    pub fn admit_reader(&self, expected_slot_id: u64) -> Option<u64> {
        let seq1 = self.sequence.load(Ordering::Acquire);
        if seq1 & 1 == 1 || seq1 == 0 {
            return None;
        }

        self.readers.fetch_add(1, Ordering::AcqRel);

        let seq2 = self.sequence.load(Ordering::Acquire);
        let id = self.slot_id.load(Ordering::Acquire);
        if seq2 != seq1 || id != expected_slot_id {
            // Overwritten (or being overwritten) between sample and grab.
            self.readers.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        Some(seq1)
    }

    /// Reader exit.
    #[inline]
    pub fn release_reader(&self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }

    /// True while the admitted sequence still stands.
    #[inline]
    pub fn still_valid(&self, admitted_seq: u64) -> bool {
        self.sequence.load(Ordering::Acquire) == admitted_seq
    }

    /// Copy out the stored checksum.
    ///
    /// The copy races a concurrent overwrite by design; callers must
    /// re-check the sequence afterwards before trusting it.
    pub fn read_checksum(&self) -> ContentHash {
        // SAFETY: plain read of the cell; torn values are rejected by the
        // caller's sequence re-check.
        ContentHash::from_bytes(unsafe { *self.checksum.get() })
    }

    /// Zero the reader count (zombie eviction / reset). Returns the count
    /// that was dropped.
    pub fn reset_readers(&self) -> u32 {
        self.readers.swap(0, Ordering::AcqRel)
    }

    /// Mark the payload as having failed validation.
    pub fn set_integrity_failed(&self) {
        self.flags
            .fetch_or(SLOT_FLAG_INTEGRITY_FAILED, Ordering::AcqRel);
    }
}

impl Default for SlotState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_size_and_alignment() {
        assert_eq!(std::mem::size_of::<SlotState>(), 128);
        assert_eq!(std::mem::align_of::<SlotState>(), 64);
    }

    #[test]
    fn test_write_cycle() {
        let state = SlotState::new();
        assert!(!state.is_writing());
        assert!(!state.is_committed());

        let prev = state.try_begin_write().expect("begin");
        assert_eq!(prev, 0);
        assert!(state.is_writing());
        assert!(state.try_begin_write().is_none());

        let hash = ContentHash::compute(b"payload");
        assert!(state.commit_write(prev, 7, &hash));
        assert!(state.is_committed());
        assert_eq!(state.sequence(), 2);
        assert_eq!(state.slot_id.load(Ordering::Acquire), 7);
        assert_eq!(state.read_checksum(), hash);
    }

    #[test]
    fn test_abort_restores_previous_state() {
        let state = SlotState::new();
        let hash = ContentHash::compute(b"x");

        let prev = state.try_begin_write().expect("begin");
        assert!(state.commit_write(prev, 0, &hash));

        let prev = state.try_begin_write().expect("begin again");
        assert_eq!(prev, 2);
        assert!(state.abort_write(prev));
        assert_eq!(state.sequence(), 2);
        assert!(state.is_committed());
    }

    #[test]
    fn test_admit_reader_on_committed_slot() {
        let state = SlotState::new();
        let prev = state.try_begin_write().expect("begin");
        state.commit_write(prev, 3, &ContentHash::compute(b"p"));

        let seq = state.admit_reader(3).expect("admit");
        assert_eq!(seq, 2);
        assert_eq!(state.readers.load(Ordering::Acquire), 1);
        assert!(state.still_valid(seq));

        state.release_reader();
        assert_eq!(state.readers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_admit_rejects_empty_and_writing() {
        let state = SlotState::new();
        assert!(state.admit_reader(0).is_none());

        let _prev = state.try_begin_write().expect("begin");
        assert!(state.admit_reader(0).is_none());
        assert_eq!(state.readers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_admit_rejects_wrong_slot_id() {
        let state = SlotState::new();
        let prev = state.try_begin_write().expect("begin");
        state.commit_write(prev, 4, &ContentHash::compute(b"p"));

        // Reader expected id 2; the slot was overwritten with id 4.
        assert!(state.admit_reader(2).is_none());
        assert_eq!(state.readers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_commit_clears_integrity_flag() {
        let state = SlotState::new();
        state.set_integrity_failed();
        assert_eq!(
            state.flags.load(Ordering::Acquire) & SLOT_FLAG_INTEGRITY_FAILED,
            SLOT_FLAG_INTEGRITY_FAILED
        );

        let prev = state.try_begin_write().expect("begin");
        state.commit_write(prev, 0, &ContentHash::compute(b"fresh"));
        assert_eq!(state.flags.load(Ordering::Acquire) & SLOT_FLAG_INTEGRITY_FAILED, 0);
    }

    #[test]
    fn test_reset_readers_reports_dropped_count() {
        let state = SlotState::new();
        let prev = state.try_begin_write().expect("begin");
        state.commit_write(prev, 0, &ContentHash::compute(b"p"));

        state.admit_reader(0).expect("admit 1");
        state.admit_reader(0).expect("admit 2");
        assert_eq!(state.reset_readers(), 2);
        assert_eq!(state.readers.load(Ordering::Acquire), 0);
    }
}
