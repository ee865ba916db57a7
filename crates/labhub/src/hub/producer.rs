// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel creation and the producer side of the protocol.

use super::header::{FormatParams, HubHeader};
use super::layout::{total_segment_size, HEADER_SIZE, LOCK_FLEX_ZONE};
use super::registry;
use super::ring::{self, ChannelMap, WriteSlot};
use crate::config::{self, RuntimeTuning};
use crate::error::{HubError, Result};
use crate::hash::ContentHash;
use crate::metrics::ChannelMetrics;
use crate::platform::{
    channel_segment_name, current_pid, is_pid_alive, ShmSegment,
};
use crate::schema::SchemaDescriptor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Slot replacement policy. Major version 1 defines only the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPolicy {
    /// Fixed ring; the writer laps slow readers
    #[default]
    RingBuffer,
}

/// Geometry and identity of a channel, fixed at creation.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of ring slots
    pub slot_count: u64,
    /// Bytes per slot
    pub slot_size: u64,
    /// Flexible zone size; rounded up to a 64-byte multiple at create
    pub flexible_zone_size: u64,
    /// Replacement policy
    pub policy: ChannelPolicy,
    /// Schema of the slot payload record, if typed
    pub datablock_schema: Option<SchemaDescriptor>,
    /// Schema of the flexible-zone record, if typed
    pub flexzone_schema: Option<SchemaDescriptor>,
    /// Application-level schema revision stored in the header
    pub schema_version: u16,
}

impl ChannelConfig {
    /// Untyped channel of `slot_count` slots of `slot_size` bytes.
    #[must_use]
    pub fn new(slot_count: u64, slot_size: u64) -> Self {
        Self {
            slot_count,
            slot_size,
            flexible_zone_size: 0,
            policy: ChannelPolicy::RingBuffer,
            datablock_schema: None,
            flexzone_schema: None,
            schema_version: 0,
        }
    }

    /// Add a flexible zone of `size` bytes (rounded up to 64).
    #[must_use]
    pub fn with_flexible_zone(mut self, size: u64) -> Self {
        self.flexible_zone_size = size;
        self
    }

    /// Attach schemas; their hashes become the attach compatibility tokens.
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

    /// Flexible zone size as actually laid out.
    pub(crate) fn rounded_flex_size(&self) -> u64 {
        super::layout::align_up(self.flexible_zone_size)
    }

    fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(HubError::ConfigMismatch("slot_count must be >= 1".into()));
        }
        if self.slot_size == 0 {
            return Err(HubError::ConfigMismatch("slot_size must be >= 1".into()));
        }
        if let Some(schema) = &self.datablock_schema {
            if self.slot_size < schema.record_size {
                return Err(HubError::ConfigMismatch(format!(
                    "slot_size {} < record size {}",
                    self.slot_size, schema.record_size
                )));
            }
        }
        if let Some(schema) = &self.flexzone_schema {
            if self.rounded_flex_size() < schema.record_size {
                return Err(HubError::ConfigMismatch(format!(
                    "flexible_zone_size {} < record size {}",
                    self.flexible_zone_size, schema.record_size
                )));
            }
        }
        self.slot_size
            .checked_mul(self.slot_count)
            .ok_or_else(|| HubError::ConfigMismatch("slot geometry overflows".into()))?;
        Ok(())
    }
}

/// The owning side of a channel.
///
/// Creates and formats the segment; the only party allowed to write slot
/// payloads, the flexible zone, and the config fields. Unlinks the segment
/// on drop.
pub struct Producer {
    map: ChannelMap,
    channel: String,
    tuning: Arc<RuntimeTuning>,
    registered: bool,
}

impl Producer {
    /// Create a channel named `channel`.
    ///
    /// A leftover segment whose producer is still alive is refused with
    /// [`HubError::Busy`]; one whose producer is dead is reclaimed (the
    /// new-producer force-reset path) by unlinking and recreating.
    pub fn create(channel: &str, cfg: &ChannelConfig) -> Result<Self> {
        Self::create_with_tuning(channel, cfg, config::tuning())
    }

    /// [`Producer::create`] with an explicit tuning snapshot.
    pub fn create_with_tuning(
        channel: &str,
        cfg: &ChannelConfig,
        tuning: Arc<RuntimeTuning>,
    ) -> Result<Self> {
        cfg.validate()?;

        if !registry::claim(channel) {
            return Err(HubError::Busy(format!(
                "channel '{channel}' already has a producer in this process"
            )));
        }

        match Self::create_claimed(channel, cfg, tuning) {
            Ok(p) => Ok(p),
            Err(e) => {
                registry::release(channel);
                Err(e)
            }
        }
    }

    fn create_claimed(
        channel: &str,
        cfg: &ChannelConfig,
        tuning: Arc<RuntimeTuning>,
    ) -> Result<Self> {
        let seg_name = channel_segment_name(channel);

        if ShmSegment::exists(&seg_name) {
            Self::reclaim_or_refuse(channel, &seg_name)?;
        }

        let flex_size = cfg.rounded_flex_size();
        let total = total_segment_size(flex_size, cfg.slot_size, cfg.slot_count);
        let segment = ShmSegment::create(&seg_name, total as usize)?;

        let params = FormatParams {
            total_size: total,
            shared_secret: random_secret(),
            flexzone_schema_hash: cfg
                .flexzone_schema
                .as_ref()
                .map_or_else(ContentHash::zero, SchemaDescriptor::hash),
            datablock_schema_hash: cfg
                .datablock_schema
                .as_ref()
                .map_or_else(ContentHash::zero, SchemaDescriptor::hash),
            schema_version: cfg.schema_version,
            slot_count: cfg.slot_count,
            slot_size: cfg.slot_size,
            flexible_zone_size: flex_size,
        };

        // SAFETY: the segment was created a moment ago with O_EXCL and its
        // secret is not yet published, so this process has exclusive access;
        // the mapping is zeroed and page-aligned.
        let header = unsafe { &mut *(segment.as_ptr() as *mut HubHeader) };
        header.format(&params);
        header.producer_heartbeat.try_claim(current_pid());

        let map = ChannelMap::over(segment)?;

        log::debug!(
            "[HUB] created channel '{channel}' ({} slots x {} B, flex {} B)",
            cfg.slot_count,
            cfg.slot_size,
            flex_size
        );

        Ok(Self {
            map,
            channel: channel.to_string(),
            tuning,
            registered: true,
        })
    }

    /// Decide what to do with an existing segment of the same name.
    fn reclaim_or_refuse(channel: &str, seg_name: &str) -> Result<()> {
        let peek = ShmSegment::open(seg_name, HEADER_SIZE)?;
        // SAFETY: the mapping covers one header page; we only read atomics
        // and format-time fields.
        let header = unsafe { &*(peek.as_ptr() as *const HubHeader) };

        if header.magic_ok() {
            let owner = header.producer_heartbeat.pid.load(Ordering::Acquire);
            if owner != 0 && is_pid_alive(owner) {
                return Err(HubError::Busy(format!(
                    "channel '{channel}' is owned by live pid {owner}"
                )));
            }
        }

        log::warn!("[HUB] reclaiming stale segment {seg_name} for channel '{channel}'");
        drop(peek);
        ShmSegment::unlink(seg_name)?;
        Ok(())
    }

    /// Take the next ring slot for writing.
    ///
    /// Blocks (bounded backoff) while readers hold the slot; after
    /// `writer_patience_ns` zombie readers are evicted and counted as
    /// overruns. `timeout_ms`: `-1` = wait forever, `0` = try once.
    pub fn acquire_write_slot(&mut self, timeout_ms: i64) -> Result<WriteSlot<'_>> {
        ring::acquire_write(&self.map, &self.tuning, timeout_ms)
    }

    /// The flexible zone span. Call
    /// [`Producer::update_flex_zone_checksum`] after mutating it.
    pub fn flex_zone_mut(&mut self) -> &mut [u8] {
        self.map.flex_zone_mut()
    }

    /// Recompute and store the flexible-zone checksum.
    pub fn update_flex_zone_checksum(&self) -> Result<()> {
        let header = self.map.header();
        let lock = header.spinlock(LOCK_FLEX_ZONE);
        let _guard = lock.acquire(&self.tuning, Some(self.default_timeout_ns()))?;
        let hash = ContentHash::compute(self.map.flex_zone());
        header.set_flexzone_checksum(&hash);
        header.producer_heartbeat.beat();
        Ok(())
    }

    /// Counter snapshot from the header.
    #[must_use]
    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics::snapshot(self.map.header())
    }

    /// The secret consumers must present, as handed to the broker.
    #[must_use]
    pub fn secret(&self) -> u64 {
        self.map.header().shared_secret
    }

    /// Channel name as given to [`Producer::create`].
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Backing segment name.
    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.map.segment_name()
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

    /// Flexible zone size as laid out.
    #[must_use]
    pub fn flexible_zone_size(&self) -> u64 {
        self.map.flex_size()
    }

    /// Next slot id the writer will publish.
    #[must_use]
    pub fn write_index(&self) -> u64 {
        self.map.header().write_index()
    }

    fn default_timeout_ns(&self) -> u64 {
        (self.tuning.acquire_default_timeout_ms.max(1) as u64) * 1_000_000
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.map.header().producer_heartbeat.release();
        if self.registered {
            registry::release(&self.channel);
        }
        let name = self.map.segment_name().to_string();
        if let Err(e) = ShmSegment::unlink(&name) {
            log::warn!("[HUB] failed to unlink {name}: {e}");
        }
        log::debug!("[HUB] destroyed channel '{}'", self.channel);
    }
}

/// Fresh channel secret.
///
/// 8 bytes of `/dev/urandom`, falling back to hashing the wall clock and
/// pid. Never zero; zero would read as "no secret" to humans in hexdumps.
fn random_secret() -> u64 {
    use std::io::Read;

    let mut buf = [0u8; 8];
    let from_urandom = std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut buf))
        .is_ok();
    if from_urandom {
        let v = u64::from_le_bytes(buf);
        if v != 0 {
            return v;
        }
    }

    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    hasher.finish() | 1
}
