// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Attachment and the consumer side of the protocol.
//!
//! Attach validation is strictly ordered - magic, version, secret, schemas,
//! config - and the only header mutation (claiming a heartbeat entry)
//! happens last, so a failed attach leaves no trace in the segment.

use super::header::HubHeader;
use super::layout::{total_segment_size, HEADER_SIZE, LOCK_FLEX_ZONE, MAX_CONSUMER_HEARTBEATS, VERSION_MAJOR};
use super::ring::{self, ChannelMap, ReadSlot, SlotIter};
use crate::config::{self, RuntimeTuning};
use crate::error::{HubError, Result};
use crate::hash::ContentHash;
use crate::metrics::ChannelMetrics;
use crate::platform::{channel_segment_name, current_pid, ShmSegment};
use crate::schema::SchemaDescriptor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// What a consumer expects of the channel it attaches to.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Secret obtained from the broker
    pub secret: u64,
    /// Expected bytes per slot
    pub slot_size: u64,
    /// Expected flexible zone size (pre-rounding; compared rounded)
    pub flexible_zone_size: u64,
    /// Expected slot count, if the caller cares
    pub slot_count: Option<u64>,
    /// Expected slot payload schema
    pub datablock_schema: Option<SchemaDescriptor>,
    /// Expected flexible-zone schema
    pub flexzone_schema: Option<SchemaDescriptor>,
}

impl AttachConfig {
    /// Expect an untyped channel with `slot_size`-byte slots.
    #[must_use]
    pub fn new(secret: u64, slot_size: u64) -> Self {
        Self {
            secret,
            slot_size,
            flexible_zone_size: 0,
            slot_count: None,
            datablock_schema: None,
            flexzone_schema: None,
        }
    }

    /// Expect a flexible zone of `size` bytes.
    #[must_use]
    pub fn with_flexible_zone(mut self, size: u64) -> Self {
        self.flexible_zone_size = size;
        self
    }

    /// Expect exactly `count` slots.
    #[must_use]
    pub fn with_slot_count(mut self, count: u64) -> Self {
        self.slot_count = Some(count);
        self
    }

    /// Expect these schemas (hash-compared at attach).
    #[must_use]
    pub fn with_schemas(
        mut self,
        datablock: Option<SchemaDescriptor>,
        flexzone: Option<SchemaDescriptor>,
    ) -> Self {
        self.datablock_schema = datablock;
        self.flexzone_schema = flexzone;
        self
    }
}

/// A reader attached to a channel.
///
/// Holds one heartbeat entry for its lifetime; the entry is what recovery
/// uses to tell a slow consumer from a dead one.
pub struct Consumer {
    map: ChannelMap,
    channel: String,
    heartbeat_index: usize,
    last_seen: Option<u64>,
    tuning: Arc<RuntimeTuning>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("channel", &self.channel)
            .field("heartbeat_index", &self.heartbeat_index)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

impl Consumer {
    /// Attach to the channel named `channel`.
    pub fn attach(channel: &str, cfg: &AttachConfig) -> Result<Self> {
        Self::attach_with_tuning(channel, cfg, config::tuning())
    }

    /// [`Consumer::attach`] with an explicit tuning snapshot.
    pub fn attach_with_tuning(
        channel: &str,
        cfg: &AttachConfig,
        tuning: Arc<RuntimeTuning>,
    ) -> Result<Self> {
        let seg_name = channel_segment_name(channel);

        // Peek one page to learn the real segment size, then map in full.
        let total = {
            let peek = open_segment(channel, &seg_name, HEADER_SIZE)?;
            // SAFETY: the peek mapping covers a full header page.
            let header = unsafe { &*(peek.as_ptr() as *const HubHeader) };
            if !header.magic_ok() {
                return Err(HubError::BadMagic);
            }
            sane_total_size(header)?
        };

        let segment = open_segment(channel, &seg_name, total as usize)?;
        // SAFETY: the full mapping covers the header page.
        let header = unsafe { &*(segment.as_ptr() as *const HubHeader) };

        // Ordered validation; nothing below mutates the header until the
        // heartbeat claim at the very end.
        if !header.magic_ok() {
            return Err(HubError::BadMagic);
        }
        let (major, _minor) = header.version();
        if major != VERSION_MAJOR {
            return Err(HubError::VersionMismatch {
                expected: VERSION_MAJOR,
                actual: major,
            });
        }
        if header.shared_secret != cfg.secret {
            return Err(HubError::AuthFailed);
        }
        if tuning.schema_validation {
            check_schema(
                &header.stored_datablock_schema_hash(),
                cfg.datablock_schema.as_ref(),
                "datablock",
            )?;
            check_schema(
                &header.stored_flexzone_schema_hash(),
                cfg.flexzone_schema.as_ref(),
                "flexible zone",
            )?;
        }
        check_config(header, cfg)?;

        let map = ChannelMap::over(segment)?;
        let heartbeat_index = claim_heartbeat(map.header())?;

        let w = map.header().write_index();
        let last_seen = w.checked_sub(1);

        log::debug!("[HUB] attached to channel '{channel}' (heartbeat slot {heartbeat_index})");

        Ok(Self {
            map,
            channel: channel.to_string(),
            heartbeat_index,
            last_seen,
            tuning,
        })
    }

    /// Iterate the committed window newest-first without blocking.
    pub fn iter_slots(&self) -> SlotIter<'_> {
        SlotIter::over(&self.map, Some(self.heartbeat()))
    }

    /// Block until a slot newer than the last one seen is committed, then
    /// admit it. `timeout_ms`: `-1` = wait forever, `0` = try once.
    pub fn acquire_latest(&mut self, timeout_ms: i64) -> Result<ReadSlot<'_>> {
        let heartbeat = &self.map.header().consumer_heartbeats[self.heartbeat_index];
        ring::acquire_latest(
            &self.map,
            &self.tuning,
            heartbeat,
            &mut self.last_seen,
            timeout_ms,
        )
    }

    /// Admit a specific slot id if it is still in the window.
    pub fn acquire_slot(&self, slot_id: u64) -> Option<ReadSlot<'_>> {
        self.heartbeat().beat();
        ring::try_acquire_read(&self.map, slot_id)
    }

    /// The flexible zone span.
    #[must_use]
    pub fn flex_zone(&self) -> &[u8] {
        self.map.flex_zone()
    }

    /// Verify the flexible zone against its stored checksum.
    pub fn verify_flex_zone_checksum(&self) -> Result<()> {
        let header = self.map.header();
        let lock = header.spinlock(LOCK_FLEX_ZONE);
        let timeout = (self.tuning.acquire_default_timeout_ms.max(1) as u64) * 1_000_000;
        let _guard = lock.acquire(&self.tuning, Some(timeout))?;

        let stored = header.flexzone_checksum();
        if stored.verify(self.map.flex_zone()) {
            Ok(())
        } else {
            header.integrity_failures.fetch_add(1, Ordering::Relaxed);
            Err(HubError::IntegrityFailure)
        }
    }

    /// Counter snapshot from the header.
    #[must_use]
    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics::snapshot(self.map.header())
    }

    /// Channel name as given to [`Consumer::attach`].
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Id of the newest slot this consumer has acquired via
    /// [`Consumer::acquire_latest`].
    #[must_use]
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Number of ring slots.
    #[must_use]
    pub fn slot_count(&self) -> u64 {
        self.map.slot_count()
    }

    /// Bytes per slot.
    #[must_use]
    pub fn slot_size(&self) -> u64 {
        self.map.slot_size()
    }

    fn heartbeat(&self) -> &super::header::HeartbeatEntry {
        &self.map.header().consumer_heartbeats[self.heartbeat_index]
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.heartbeat().release();
        log::debug!("[HUB] detached from channel '{}'", self.channel);
    }
}

fn open_segment(channel: &str, seg_name: &str, size: usize) -> Result<ShmSegment> {
    match ShmSegment::open(seg_name, size) {
        Ok(seg) => Ok(seg),
        Err(crate::platform::ShmError::NotFound(_)) => {
            Err(HubError::NotFound(channel.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Cross-check the header's own size claim against its geometry before we
/// trust it as a mapping length.
fn sane_total_size(header: &HubHeader) -> Result<u64> {
    const LIMIT: u64 = 1 << 40;
    let count = header.slot_count();
    let size = header.slot_size();
    let flex = header.flexible_zone_size();
    if count == 0
        || size == 0
        || count > LIMIT
        || size > LIMIT
        || flex > LIMIT
        || size.checked_mul(count).is_none()
    {
        return Err(HubError::StateInvalid("implausible slot geometry".into()));
    }
    let expected = total_segment_size(flex, size, count);
    if header.total_size() != expected {
        return Err(HubError::StateInvalid(format!(
            "header total_size {} disagrees with geometry {}",
            header.total_size(),
            expected
        )));
    }
    Ok(expected)
}

fn check_schema(
    stored: &ContentHash,
    expected: Option<&SchemaDescriptor>,
    zone: &'static str,
) -> Result<()> {
    let expected_hash = expected.map_or_else(ContentHash::zero, SchemaDescriptor::hash);
    if *stored != expected_hash {
        return Err(HubError::SchemaMismatch { zone });
    }
    Ok(())
}

fn check_config(header: &HubHeader, cfg: &AttachConfig) -> Result<()> {
    if header.slot_size() != cfg.slot_size {
        return Err(HubError::ConfigMismatch(format!(
            "slot_size: channel has {}, caller expects {}",
            header.slot_size(),
            cfg.slot_size
        )));
    }
    let expected_flex = super::layout::align_up(cfg.flexible_zone_size);
    if header.flexible_zone_size() != expected_flex {
        return Err(HubError::ConfigMismatch(format!(
            "flexible_zone_size: channel has {}, caller expects {}",
            header.flexible_zone_size(),
            expected_flex
        )));
    }
    if let Some(count) = cfg.slot_count {
        if header.slot_count() != count {
            return Err(HubError::ConfigMismatch(format!(
                "slot_count: channel has {}, caller expects {count}",
                header.slot_count()
            )));
        }
    }
    Ok(())
}

/// Claim a free heartbeat entry, reclaiming dead owners along the way.
fn claim_heartbeat(header: &HubHeader) -> Result<usize> {
    let pid = current_pid();
    for (i, entry) in header.consumer_heartbeats.iter().enumerate() {
        if let Some(dead) = entry.reclaim_if_dead() {
            log::warn!("[HUB] reclaimed heartbeat slot {i} from dead pid {dead}");
        }
        if entry.try_claim(pid) {
            return Ok(i);
        }
    }
    debug_assert_eq!(header.consumer_heartbeats.len(), MAX_CONSUMER_HEARTBEATS);
    Err(HubError::HeartbeatPoolExhausted)
}
