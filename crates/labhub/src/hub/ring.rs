// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot ring coordination: the writer and reader protocols.
//!
//! # Writer (single producer)
//!
//! 1. `idx = write_index`, physical slot `idx mod N`
//! 2. Wait for `readers == 0`; after `writer_patience_ns`, evict the count
//!    iff every claimed consumer heartbeat is zombie (overrun accounting)
//! 3. CAS sequence even -> odd, record writer pid / write ns
//! 4. Caller fills the payload span through the handle
//! 5. Commit: checksum -> slot_id -> sequence even (Release) ->
//!    `write_index = idx + 1` (Release). The order is load-bearing.
//!
//! # Reader (many)
//!
//! Non-blocking: sample ids `[max(0, w-N), w)` newest-first; admission is
//! fetch-add on `readers` plus a sequence/slot-id re-check. Blocking:
//! backoff until `write_index - 1` passes the last seen id, then admit.
//!
//! Post-read validation recomputes the payload digest; a changed sequence or
//! a digest mismatch marks the read `Invalidated`.

use super::header::HubHeader;
use super::layout::{
    slot_payload_offset, slot_states_offset, total_segment_size, HEADER_SIZE,
};
use super::slot::SlotState;
use crate::backoff::Backoff;
use crate::config::RuntimeTuning;
use crate::error::{HubError, Result};
use crate::hash::ContentHash;
use crate::hub::header::HeartbeatEntry;
use crate::platform::{current_pid, monotonic_ns, ShmSegment};
use std::sync::atomic::Ordering;

/// Attempts to flip the seqlock before a disturbed word is reported as
/// corruption.
const BEGIN_WRITE_RETRIES: u32 = 4;

/// A mapped channel segment with its geometry resolved.
///
/// All addressing is offset-based so the same segment can land at different
/// base addresses in different processes.
pub(crate) struct ChannelMap {
    segment: ShmSegment,
    slot_count: u64,
    slot_size: u64,
    flex_size: u64,
    payload_base: usize,
    states_base: usize,
}

impl ChannelMap {
    /// Resolve geometry from a fully mapped segment.
    ///
    /// The caller has already validated magic and version on a header peek;
    /// this re-derives the offsets and cross-checks them against the mapping
    /// size so a corrupt header cannot send us out of bounds.
    pub(crate) fn over(segment: ShmSegment) -> Result<Self> {
        if segment.size() < HEADER_SIZE {
            return Err(HubError::StateInvalid("segment smaller than header".into()));
        }

        // SAFETY: the mapping is at least HEADER_SIZE bytes and mmap returns
        // page-aligned memory, satisfying HubHeader's alignment.
        let header = unsafe { &*(segment.as_ptr() as *const HubHeader) };

        let slot_count = header.slot_count();
        let slot_size = header.slot_size();
        let flex_size = header.flexible_zone_size();
        if slot_count == 0 || slot_size == 0 {
            return Err(HubError::StateInvalid("zero slot geometry".into()));
        }

        let expected = total_segment_size(flex_size, slot_size, slot_count);
        if header.total_size() != expected || (segment.size() as u64) < expected {
            return Err(HubError::StateInvalid(format!(
                "segment size {} does not match geometry ({} expected)",
                segment.size(),
                expected
            )));
        }

        Ok(Self {
            segment,
            slot_count,
            slot_size,
            flex_size,
            payload_base: slot_payload_offset(flex_size, slot_size, 0) as usize,
            states_base: slot_states_offset(flex_size, slot_size, slot_count) as usize,
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> &HubHeader {
        // SAFETY: validated in over(); the header occupies the first page of
        // the mapping for the lifetime of self.
        unsafe { &*(self.segment.as_ptr() as *const HubHeader) }
    }

    #[inline]
    pub(crate) fn slot_count(&self) -> u64 {
        self.slot_count
    }

    #[inline]
    pub(crate) fn slot_size(&self) -> u64 {
        self.slot_size
    }

    #[inline]
    pub(crate) fn flex_size(&self) -> u64 {
        self.flex_size
    }

    pub(crate) fn segment_name(&self) -> &str {
        self.segment.name()
    }

    /// Slot state for a physical slot index.
    #[inline]
    pub(crate) fn slot_state(&self, phys: u64) -> &SlotState {
        debug_assert!(phys < self.slot_count);
        // SAFETY: over() verified the mapping covers the state array;
        // states_base is 64-byte aligned by construction and phys is in
        // bounds. SlotState is all-atomic, so sharing across parties is
        // sound.
        unsafe {
            &*(self
                .segment
                .as_ptr()
                .add(self.states_base + phys as usize * std::mem::size_of::<SlotState>())
                as *const SlotState)
        }
    }

    /// Raw payload pointer for a physical slot.
    #[inline]
    pub(crate) fn payload_ptr(&self, phys: u64) -> *mut u8 {
        debug_assert!(phys < self.slot_count);
        // SAFETY: in bounds per over()'s size check.
        unsafe {
            self.segment
                .as_ptr()
                .add(self.payload_base + (phys * self.slot_size) as usize)
        }
    }

    /// Flexible zone as a shared byte slice.
    #[inline]
    pub(crate) fn flex_zone(&self) -> &[u8] {
        // SAFETY: the flexible zone sits between header and payloads and is
        // covered by the size check in over(). Producer-side mutation races
        // are accepted per the checksum-verify contract.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(HEADER_SIZE),
                self.flex_size as usize,
            )
        }
    }

    /// Flexible zone as a mutable byte slice. Producer only.
    #[inline]
    pub(crate) fn flex_zone_mut(&self) -> &mut [u8] {
        // SAFETY: only the single producer calls this, per the ownership
        // rules enforced by the public API surface.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.as_ptr().add(HEADER_SIZE),
                self.flex_size as usize,
            )
        }
    }
}

/// Compute the deadline for a `timeout_ms` argument.
///
/// `-1` waits forever, `0` is try-once, positive is milliseconds from now;
/// any other negative value falls back to the configured default.
pub(crate) fn deadline_ns(timeout_ms: i64, tuning: &RuntimeTuning) -> Option<u64> {
    let ms = if timeout_ms < -1 {
        tuning.acquire_default_timeout_ms
    } else {
        timeout_ms
    };
    match ms {
        -1 => None,
        0 => Some(monotonic_ns()),
        ms => Some(monotonic_ns().saturating_add((ms as u64).saturating_mul(1_000_000))),
    }
}

/// True when every claimed consumer heartbeat is zombie, i.e. no live
/// consumer can be holding a reader count.
fn no_live_consumers(header: &HubHeader, tuning: &RuntimeTuning, now_ns: u64) -> bool {
    header
        .consumer_heartbeats
        .iter()
        .all(|entry| !entry.is_claimed() || entry.is_zombie(now_ns, tuning.reader_timeout_ns))
}

/// Writer entry point: wait for the target slot to drain, then take it.
pub(crate) fn acquire_write<'a>(
    map: &'a ChannelMap,
    tuning: &RuntimeTuning,
    timeout_ms: i64,
) -> Result<WriteSlot<'a>> {
    let header = map.header();
    // Relaxed: the single producer is the only writer of write_index.
    let slot_id = header.write_index.load(Ordering::Relaxed);
    let state = map.slot_state(slot_id % map.slot_count());

    let start = monotonic_ns();
    let deadline = deadline_ns(timeout_ms, tuning);
    let mut backoff = Backoff::new(tuning);

    while state.readers.load(Ordering::Acquire) != 0 {
        let now = monotonic_ns();

        if now.saturating_sub(start) >= tuning.writer_patience_ns
            && no_live_consumers(header, tuning, now)
        {
            let dropped = state.reset_readers();
            if dropped > 0 {
                header
                    .overruns
                    .fetch_add(u64::from(dropped), Ordering::Relaxed);
                log::warn!(
                    "[HUB] evicted {dropped} zombie reader(s) from slot {} of {}",
                    slot_id % map.slot_count(),
                    map.segment_name()
                );
            }
            break;
        }

        if let Some(d) = deadline {
            if now >= d {
                header.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(HubError::Timeout);
            }
        }

        backoff.snooze();
        header.producer_heartbeat.beat();
    }

    let mut prev = None;
    for _ in 0..BEGIN_WRITE_RETRIES {
        prev = state.try_begin_write();
        if prev.is_some() {
            break;
        }
    }
    let Some(prev_seq) = prev else {
        header.acquire_failures.fetch_add(1, Ordering::Relaxed);
        return Err(HubError::StateInvalid(format!(
            "slot {} sequence is wedged odd",
            slot_id % map.slot_count()
        )));
    };

    state.writer_pid.store(current_pid(), Ordering::Release);
    state.write_ns.store(monotonic_ns(), Ordering::Release);
    header.producer_heartbeat.beat();

    Ok(WriteSlot {
        map,
        state,
        slot_id,
        prev_seq,
        committed: false,
    })
}

/// Try to admit a reader on a specific slot id without blocking.
pub(crate) fn try_acquire_read(map: &ChannelMap, slot_id: u64) -> Option<ReadSlot<'_>> {
    let header = map.header();
    let w = header.write_index.load(Ordering::Acquire);

    if slot_id >= w || w - slot_id > map.slot_count() {
        // Not committed yet, or already lapped by the ring.
        return None;
    }

    let state = map.slot_state(slot_id % map.slot_count());
    let seq = state.admit_reader(slot_id)?;

    Some(ReadSlot {
        map,
        state,
        slot_id,
        seq,
        released: false,
    })
}

/// Blocking acquire of the newest committed slot beyond `last_seen`.
pub(crate) fn acquire_latest<'a>(
    map: &'a ChannelMap,
    tuning: &RuntimeTuning,
    heartbeat: &HeartbeatEntry,
    last_seen: &mut Option<u64>,
    timeout_ms: i64,
) -> Result<ReadSlot<'a>> {
    let header = map.header();
    heartbeat.beat();

    let deadline = deadline_ns(timeout_ms, tuning);
    let mut backoff = Backoff::new(tuning);

    loop {
        let mut lapped = false;
        let w = header.write_index.load(Ordering::Acquire);
        if w > 0 {
            let newest = w - 1;
            if last_seen.is_none_or(|seen| newest > seen) {
                if let Some(slot) = try_acquire_read(map, newest) {
                    *last_seen = Some(newest);
                    heartbeat.beat();
                    header.read_index_hint.fetch_max(newest, Ordering::AcqRel);
                    return Ok(slot);
                }
                // Overwritten between the index load and admission; the
                // writer made progress, so resample without sleeping.
                lapped = true;
            }
        }

        if let Some(d) = deadline {
            if monotonic_ns() >= d {
                header.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(HubError::Timeout);
            }
        }

        if lapped {
            backoff.reset();
        } else {
            backoff.snooze();
        }
        heartbeat.beat();
    }
}

/// Exclusive write access to one slot, plus the flexible zone.
///
/// Dropping the handle without committing aborts the write and leaves the
/// previous commit visible.
pub struct WriteSlot<'a> {
    map: &'a ChannelMap,
    state: &'a SlotState,
    slot_id: u64,
    prev_seq: u64,
    committed: bool,
}

impl WriteSlot<'_> {
    /// Monotonic id this commit will publish as.
    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// The slot's payload span.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let phys = self.slot_id % self.map.slot_count();
        // SAFETY: the odd sequence taken in acquire_write() gives this
        // handle exclusive write ownership of the span; admitted readers
        // from before the flip detect the overwrite at validation.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.map.payload_ptr(phys),
                self.map.slot_size() as usize,
            )
        }
    }

    /// The flexible zone span (producer-owned scratch).
    pub fn flex_zone_mut(&mut self) -> &mut [u8] {
        self.map.flex_zone_mut()
    }

    /// Publish: checksum, slot id, sequence, then the write index.
    pub fn commit(mut self) -> Result<u64> {
        let phys = self.slot_id % self.map.slot_count();
        // SAFETY: same exclusivity argument as payload_mut(); shared read
        // here only.
        let payload = unsafe {
            std::slice::from_raw_parts(self.map.payload_ptr(phys), self.map.slot_size() as usize)
        };
        let hash = ContentHash::compute(payload);

        if !self.state.commit_write(self.prev_seq, self.slot_id, &hash) {
            // The seqlock word moved while we held it; only a diagnostic
            // tool can do that. Report rather than guess.
            self.committed = true; // suppress the Drop-abort on a foreign state
            return Err(HubError::StateInvalid(format!(
                "commit of slot id {} found a disturbed sequence",
                self.slot_id
            )));
        }
        self.committed = true;

        let header = self.map.header();
        header
            .write_index
            .store(self.slot_id + 1, Ordering::Release);
        header.writes.fetch_add(1, Ordering::Relaxed);
        header.producer_heartbeat.beat();

        Ok(self.slot_id)
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.state.abort_write(self.prev_seq);
            self.map.header().producer_heartbeat.beat();
        }
    }
}

/// Outcome of releasing a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadValidity {
    /// Payload matched its checksum and was never overwritten
    Valid,
    /// Overwritten mid-read or failed the checksum; do not trust the bytes
    Invalidated,
}

/// Shared read access to one committed slot.
///
/// The payload span may be invalidated by a writer that evicted us; call
/// [`ReadSlot::release`] (or [`ReadSlot::validate`]) before trusting data
/// copied out of it.
pub struct ReadSlot<'a> {
    map: &'a ChannelMap,
    state: &'a SlotState,
    slot_id: u64,
    seq: u64,
    released: bool,
}

impl std::fmt::Debug for ReadSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSlot")
            .field("slot_id", &self.slot_id)
            .field("seq", &self.seq)
            .field("released", &self.released)
            .finish()
    }
}

impl ReadSlot<'_> {
    /// Monotonic id of the commit this handle admitted on.
    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// The payload span.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let phys = self.slot_id % self.map.slot_count();
        // SAFETY: the span is in bounds; bytes may be concurrently
        // overwritten only after this reader has been evicted, which
        // release()/validate() detect via the sequence re-check.
        unsafe {
            std::slice::from_raw_parts(self.map.payload_ptr(phys), self.map.slot_size() as usize)
        }
    }

    /// Copy the payload out. Returns the number of bytes written.
    pub fn read_into(&self, buf: &mut [u8]) -> usize {
        let src = self.payload();
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Re-check this read without releasing it.
    #[must_use]
    pub fn validate(&self) -> bool {
        if !self.state.still_valid(self.seq) {
            return false;
        }
        let stored = self.state.read_checksum();
        let computed = ContentHash::compute(self.payload());
        self.state.still_valid(self.seq) && stored == computed
    }

    /// Release the read and report whether the data was trustworthy.
    pub fn release(mut self) -> ReadValidity {
        let validity = if !self.state.still_valid(self.seq) {
            ReadValidity::Invalidated
        } else {
            let stored = self.state.read_checksum();
            let computed = ContentHash::compute(self.payload());
            if !self.state.still_valid(self.seq) {
                ReadValidity::Invalidated
            } else if stored == computed {
                ReadValidity::Valid
            } else {
                // Sequence stable but bytes wrong: genuine corruption.
                self.state.set_integrity_failed();
                self.map
                    .header()
                    .integrity_failures
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[HUB] checksum mismatch on slot id {} of {}",
                    self.slot_id,
                    self.map.segment_name()
                );
                ReadValidity::Invalidated
            }
        };

        self.state.release_reader();
        self.released = true;
        validity
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.state.release_reader();
        }
    }
}

/// Newest-first, non-blocking iterator over the committed window.
pub struct SlotIter<'a> {
    map: &'a ChannelMap,
    heartbeat: Option<&'a HeartbeatEntry>,
    /// Next candidate id + 1 (0 = exhausted)
    cursor: u64,
    /// Lowest id still in the window
    floor: u64,
}

impl<'a> SlotIter<'a> {
    pub(crate) fn over(map: &'a ChannelMap, heartbeat: Option<&'a HeartbeatEntry>) -> Self {
        let w = map.header().write_index.load(Ordering::Acquire);
        Self {
            map,
            heartbeat,
            cursor: w,
            floor: w.saturating_sub(map.slot_count()),
        }
    }
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = ReadSlot<'a>;

    fn next(&mut self) -> Option<ReadSlot<'a>> {
        while self.cursor > self.floor {
            self.cursor -= 1;
            if let Some(slot) = try_acquire_read(self.map, self.cursor) {
                if let Some(hb) = self.heartbeat {
                    hb.beat();
                }
                return Some(slot);
            }
            // Overwritten mid-scan; older candidates may still admit.
        }
        None
    }
}
