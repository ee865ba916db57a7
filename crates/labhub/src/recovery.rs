// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recovery and diagnostics for damaged or orphaned channels.
//!
//! Everything here operates on a channel by name, outside the normal
//! producer/consumer attach path: integrity scanning, forced reset, targeted
//! zombie release, and a read-only diagnostic view that bypasses the shared
//! secret (gated by the deployment admin token) without ever touching reader
//! counts or heartbeats.

use crate::config;
use crate::error::{HubError, Result};
use crate::hash::ContentHash;
use crate::hub::header::HubHeader;
use crate::hub::layout::{HEADER_SIZE, LOCK_RECOVERY, VERSION_MAJOR};
use crate::hub::ring::ChannelMap;
use crate::metrics::ChannelMetrics;
use crate::platform::{
    channel_segment_name, is_pid_alive, monotonic_ns, ShmSegment, SEGMENT_NAME_PREFIX,
};
use std::sync::atomic::Ordering;

/// Environment variable holding the 32-byte deployment admin token (hex).
pub const ADMIN_TOKEN_ENV: &str = "LABHUB_ADMIN_TOKEN";

/// Result of an integrity scan.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Slot ids whose stored checksum does not match the payload
    pub checksum_mismatches: Vec<u64>,
    /// Pid of a dead writer still marked as holding a slot
    pub stale_writer_pid: Option<u64>,
    /// Pids of zombie consumer heartbeat entries
    pub stale_reader_pids: Vec<u64>,
    /// Flexible zone failed its checksum
    pub flexzone_mismatch: bool,
}

impl IntegrityReport {
    /// True when the scan found nothing wrong.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.checksum_mismatches.is_empty()
            && self.stale_writer_pid.is_none()
            && self.stale_reader_pids.is_empty()
            && !self.flexzone_mismatch
    }
}

/// What a force reset actually did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOutcome {
    /// Writing slots aborted back to their previous commit
    pub aborted_writes: u32,
    /// Reader counts dropped to zero
    pub cleared_readers: u32,
    /// Heartbeat entries freed (dead pids)
    pub cleared_heartbeats: u32,
}

/// Open a channel for recovery by name: magic and version gate only.
fn open_map(channel: &str) -> Result<ChannelMap> {
    let seg_name = channel_segment_name(channel);

    let total = {
        let peek = match ShmSegment::open(&seg_name, HEADER_SIZE) {
            Ok(seg) => seg,
            Err(crate::platform::ShmError::NotFound(_)) => {
                return Err(HubError::NotFound(channel.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        // SAFETY: the peek mapping covers a full header page.
        let header = unsafe { &*(peek.as_ptr() as *const HubHeader) };
        if !header.magic_ok() {
            return Err(HubError::BadMagic);
        }
        let (major, _) = header.version();
        if major != VERSION_MAJOR {
            return Err(HubError::VersionMismatch {
                expected: VERSION_MAJOR,
                actual: major,
            });
        }
        header.total_size()
    };

    let segment = ShmSegment::open(&seg_name, total as usize)?;
    ChannelMap::over(segment)
}

/// Scan a channel for damage without disturbing it.
///
/// Committed slots are hashed and compared to their stored checksums; a
/// sequence that moves mid-hash (live writer traffic) is skipped rather than
/// reported.
pub fn validate_integrity(channel: &str) -> Result<IntegrityReport> {
    let map = open_map(channel)?;
    let tuning = config::tuning();
    let header = map.header();
    let now = monotonic_ns();
    let mut report = IntegrityReport::default();

    for phys in 0..map.slot_count() {
        let state = map.slot_state(phys);
        let seq = state.sequence();

        if seq & 1 == 1 {
            let pid = state.writer_pid.load(Ordering::Acquire);
            if pid != 0 && !is_pid_alive(pid) {
                report.stale_writer_pid = Some(pid);
            }
            continue;
        }
        if seq == 0 {
            continue;
        }

        // SAFETY: in bounds per ChannelMap::over's geometry check; shared
        // read raced only by a live writer, which the re-check below skips.
        let payload = unsafe {
            std::slice::from_raw_parts(map.payload_ptr(phys), map.slot_size() as usize)
        };
        let stored = state.read_checksum();
        let computed = ContentHash::compute(payload);
        if state.sequence() == seq && stored != computed {
            report.checksum_mismatches.push(state.slot_id.load(Ordering::Acquire));
        }
    }

    for entry in &header.consumer_heartbeats {
        let pid = entry.pid.load(Ordering::Acquire);
        if pid != 0 && entry.is_zombie(now, tuning.reader_timeout_ns) {
            report.stale_reader_pids.push(pid);
        }
    }

    if map.flex_size() > 0 {
        let stored = header.flexzone_checksum();
        if !stored.verify(map.flex_zone()) {
            report.flexzone_mismatch = true;
        }
    }

    Ok(report)
}

/// Force a channel back to a usable state.
///
/// Bumps the generation, zeroes every reader count, aborts any in-progress
/// write, and frees heartbeat entries whose owners are dead. Keeps the
/// shared secret. Idempotent on a quiescent channel.
pub fn force_reset(channel: &str) -> Result<ResetOutcome> {
    let map = open_map(channel)?;
    let tuning = config::tuning();
    let header = map.header();

    let _guard = header
        .spinlock(LOCK_RECOVERY)
        .acquire(&tuning, Some(tuning.reader_timeout_ns))?;

    header.generation.fetch_add(1, Ordering::AcqRel);

    let mut outcome = ResetOutcome::default();
    for phys in 0..map.slot_count() {
        let state = map.slot_state(phys);

        if state.reset_readers() > 0 {
            outcome.cleared_readers += 1;
        }

        let seq = state.sequence();
        if seq & 1 == 1 && state.abort_write(seq - 1) {
            outcome.aborted_writes += 1;
            log::warn!("[RECOVERY] aborted in-progress write on slot {phys} of '{channel}'");
        }
    }

    if header.producer_heartbeat.reclaim_if_dead().is_some() {
        outcome.cleared_heartbeats += 1;
    }
    for entry in &header.consumer_heartbeats {
        if entry.reclaim_if_dead().is_some() {
            outcome.cleared_heartbeats += 1;
        }
    }

    log::debug!(
        "[RECOVERY] force reset of '{channel}': {} writes aborted, {} reader counts cleared, {} heartbeats freed",
        outcome.aborted_writes,
        outcome.cleared_readers,
        outcome.cleared_heartbeats
    );

    Ok(outcome)
}

/// Abort a write held by a dead producer. Returns true if one was released.
pub fn release_zombie_writer(channel: &str) -> Result<bool> {
    let map = open_map(channel)?;
    let mut released = false;

    for phys in 0..map.slot_count() {
        let state = map.slot_state(phys);
        let seq = state.sequence();
        if seq & 1 == 0 {
            continue;
        }
        let pid = state.writer_pid.load(Ordering::Acquire);
        if pid != 0 && !is_pid_alive(pid) && state.abort_write(seq - 1) {
            log::warn!(
                "[RECOVERY] released zombie writer pid {pid} on slot {phys} of '{channel}'"
            );
            released = true;
        }
    }

    if map.header().producer_heartbeat.reclaim_if_dead().is_some() {
        released = true;
    }

    Ok(released)
}

/// Drop reader counts held by dead or timed-out consumers.
///
/// Reader counts carry no per-consumer attribution, so counts are cleared
/// only when no live consumer remains. Returns the number of reader counts
/// dropped.
pub fn release_zombie_readers(channel: &str) -> Result<u32> {
    let map = open_map(channel)?;
    let tuning = config::tuning();
    let header = map.header();
    let now = monotonic_ns();

    let any_live = header.consumer_heartbeats.iter().any(|entry| {
        entry.is_claimed() && !entry.is_zombie(now, tuning.reader_timeout_ns)
    });
    if any_live {
        return Ok(0);
    }

    let mut dropped = 0u32;
    for phys in 0..map.slot_count() {
        dropped += map.slot_state(phys).reset_readers();
    }
    if dropped > 0 {
        header.overruns.fetch_add(u64::from(dropped), Ordering::Relaxed);
        log::warn!("[RECOVERY] dropped {dropped} zombie reader count(s) on '{channel}'");
    }

    for entry in &header.consumer_heartbeats {
        entry.reclaim_if_dead();
    }

    Ok(dropped)
}

/// Sweep `/dev/shm` for labhub segments whose producer is gone and unlink
/// them. Startup hygiene; returns the number of segments removed.
pub fn cleanup_stale_channels() -> usize {
    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    let prefix = &SEGMENT_NAME_PREFIX[1..]; // directory listing has no '/'
    let mut cleaned = 0;

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }

        let seg_name = format!("/{name}");
        if segment_is_orphaned(&seg_name) && ShmSegment::unlink(&seg_name).is_ok() {
            log::debug!("[RECOVERY] cleaned up stale segment {seg_name}");
            cleaned += 1;
        }
    }

    cleaned
}

/// A segment is orphaned when its header parses and its producer heartbeat
/// names a dead (or absent) pid.
fn segment_is_orphaned(seg_name: &str) -> bool {
    let Ok(peek) = ShmSegment::open(seg_name, HEADER_SIZE) else {
        return false;
    };
    // SAFETY: the peek mapping covers a full header page.
    let header = unsafe { &*(peek.as_ptr() as *const HubHeader) };
    if !header.magic_ok() {
        // Unrecognisable content under our prefix: leave it alone.
        return false;
    }
    let owner = header.producer_heartbeat.pid.load(Ordering::Acquire);
    owner == 0 || !is_pid_alive(owner)
}

/// Per-slot state copy for inspection.
#[derive(Debug, Clone, Copy)]
pub struct SlotStateInfo {
    pub sequence: u64,
    pub slot_id: u64,
    pub readers: u32,
    pub flags: u32,
    pub writer_pid: u64,
    pub write_ns: u64,
}

/// Read-only view of a channel for tooling.
///
/// Obtained via [`open_for_diagnostic`]; bypasses the shared secret but
/// never increments reader counts and never touches heartbeats, so it is
/// invisible to the protocol.
pub struct DiagnosticView {
    map: ChannelMap,
    channel: String,
}

impl std::fmt::Debug for DiagnosticView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticView")
            .field("channel", &self.channel)
            .finish()
    }
}

impl DiagnosticView {
    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// `(major, minor)` from the header.
    #[must_use]
    pub fn version(&self) -> (u16, u16) {
        self.map.header().version()
    }

    /// Ring geometry: `(slot_count, slot_size, flexible_zone_size)`.
    #[must_use]
    pub fn geometry(&self) -> (u64, u64, u64) {
        (
            self.map.slot_count(),
            self.map.slot_size(),
            self.map.flex_size(),
        )
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics::snapshot(self.map.header())
    }

    /// Producer heartbeat as `(pid, age_ns)`; pid 0 when unclaimed.
    #[must_use]
    pub fn producer_heartbeat(&self) -> (u64, u64) {
        let hb = &self.map.header().producer_heartbeat;
        let pid = hb.pid.load(Ordering::Acquire);
        let age = monotonic_ns().saturating_sub(hb.last_ns.load(Ordering::Acquire));
        (pid, age)
    }

    /// Claimed consumer heartbeats as `(index, pid, age_ns)`.
    #[must_use]
    pub fn consumer_heartbeats(&self) -> Vec<(usize, u64, u64)> {
        let now = monotonic_ns();
        self.map
            .header()
            .consumer_heartbeats
            .iter()
            .enumerate()
            .filter_map(|(i, hb)| {
                let pid = hb.pid.load(Ordering::Acquire);
                (pid != 0).then(|| {
                    (i, pid, now.saturating_sub(hb.last_ns.load(Ordering::Acquire)))
                })
            })
            .collect()
    }

    /// State copy for the physical slot `phys`.
    #[must_use]
    pub fn slot_state(&self, phys: u64) -> SlotStateInfo {
        let state = self.map.slot_state(phys % self.map.slot_count());
        SlotStateInfo {
            sequence: state.sequence(),
            slot_id: state.slot_id.load(Ordering::Acquire),
            readers: state.readers.load(Ordering::Acquire),
            flags: state.flags.load(Ordering::Acquire),
            writer_pid: state.writer_pid.load(Ordering::Acquire),
            write_ns: state.write_ns.load(Ordering::Acquire),
        }
    }

    /// Copy a slot payload out without admitting a reader.
    ///
    /// The copy can race the writer; this is tooling, the protocol does not
    /// know we are here.
    #[must_use]
    pub fn peek_payload(&self, phys: u64) -> Vec<u8> {
        let phys = phys % self.map.slot_count();
        // SAFETY: in bounds per the geometry check at open.
        let payload = unsafe {
            std::slice::from_raw_parts(self.map.payload_ptr(phys), self.map.slot_size() as usize)
        };
        payload.to_vec()
    }
}

/// Open a read-only diagnostic view, bypassing the shared secret.
///
/// Gated by the deployment admin token: the caller's token must match the
/// one in `LABHUB_ADMIN_TOKEN` (64 hex chars). Refused when the variable is
/// unset.
pub fn open_for_diagnostic(channel: &str, admin_token: &[u8; 32]) -> Result<DiagnosticView> {
    let Some(deployed) = deployment_admin_token() else {
        return Err(HubError::AuthFailed);
    };
    if &deployed != admin_token {
        return Err(HubError::AuthFailed);
    }

    let map = open_map(channel)?;
    Ok(DiagnosticView {
        map,
        channel: channel.to_string(),
    })
}

/// The deployment admin token from the environment, if configured.
#[must_use]
pub fn deployment_admin_token() -> Option<[u8; 32]> {
    let hex = std::env::var(ADMIN_TOKEN_ENV).ok()?;
    let hex = hex.trim();
    if hex.len() != 64 {
        return None;
    }
    let mut token = [0u8; 32];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_token_parse() {
        std::env::set_var(ADMIN_TOKEN_ENV, "00".repeat(32));
        assert_eq!(deployment_admin_token(), Some([0u8; 32]));

        std::env::set_var(ADMIN_TOKEN_ENV, "ff".repeat(32));
        assert_eq!(deployment_admin_token(), Some([0xffu8; 32]));

        std::env::set_var(ADMIN_TOKEN_ENV, "nothex");
        assert_eq!(deployment_admin_token(), None);

        std::env::remove_var(ADMIN_TOKEN_ENV);
        assert_eq!(deployment_admin_token(), None);
    }

    #[test]
    fn test_validate_integrity_missing_channel() {
        let result = validate_integrity("recovery_no_such_channel");
        assert!(matches!(result, Err(HubError::NotFound(_))));
    }

    #[test]
    fn test_report_is_clean_default() {
        assert!(IntegrityReport::default().is_clean());
    }
}
