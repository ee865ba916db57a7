// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # labhub - shared-memory data exchange hub
//!
//! Single-producer / multi-consumer record exchange over POSIX shared
//! memory, for processes on one host. A producer publishes fixed-layout
//! records into a ring of slots; consumers attach by name, prove they know
//! the channel secret, and read either the latest record (blocking) or the
//! whole committed window (non-blocking), with every read validated against
//! a BLAKE2b-256 checksum.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use labhub::{AttachConfig, ChannelConfig, Consumer, Producer, Result};
//!
//! fn main() -> Result<()> {
//!     // Producer side
//!     let mut producer = Producer::create("sensors/temp", &ChannelConfig::new(64, 256))?;
//!     let mut slot = producer.acquire_write_slot(-1)?;
//!     slot.payload_mut()[..8].copy_from_slice(&42u64.to_le_bytes());
//!     slot.commit()?;
//!
//!     // Consumer side (secret comes from the broker)
//!     let mut consumer = Consumer::attach(
//!         "sensors/temp",
//!         &AttachConfig::new(producer.secret(), 256),
//!     )?;
//!     let read = consumer.acquire_latest(100)?;
//!     let bytes = read.payload().to_vec();
//!     read.release();
//!     let _ = bytes;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Producer / Consumer                     |
//! |   create/attach, schema validation, heartbeats, flex zone    |
//! +--------------------------------------------------------------+
//! |                       Slot coordinator                       |
//! |   seqlock write protocol | reader admission | reclamation    |
//! +--------------------------------------------------------------+
//! |                  Header + slot state (shm)                   |
//! |   magic/version/secret | spinlocks | heartbeats | metrics    |
//! +--------------------------------------------------------------+
//! |                     Platform primitives                      |
//! |   shm_open/mmap | CLOCK_MONOTONIC | pid liveness probe       |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Producer`] | Creates and owns a channel, publishes records |
//! | [`Consumer`] | Attaches by name + secret, reads records |
//! | [`WriteSlot`] | Exclusive handle on one slot until commit/abort |
//! | [`ReadSlot`] | Shared handle on one committed slot, validated on release |
//! | [`SchemaDescriptor`] | Record layout whose hash gates attachment |
//! | [`BrokerClient`] | Registers/discovers channel names and secrets |
//!
//! Recovery tooling (integrity scans, force reset, zombie release, the
//! diagnostic view) lives in [`recovery`].

/// Bounded exponential backoff used at the blocking points.
pub mod backoff;
/// Broker client (channel registration and discovery).
pub mod broker;
/// Tuning knobs and their environment overrides.
pub mod config;
/// Error taxonomy with stable wire codes.
pub mod error;
/// BLAKE2b-256 content hashing.
pub mod hash;
/// The channel core: header, slots, ring protocol, producer/consumer.
pub mod hub;
/// Channel counter snapshots.
pub mod metrics;
/// Platform primitives: shm, monotonic clock, pid liveness.
pub mod platform;
/// Recovery and diagnostics.
pub mod recovery;
/// Record schema descriptors and canonical hashing.
pub mod schema;

pub use broker::{BrokerClient, BrokerError, ChannelLocation, ChannelRegistration};
pub use error::{HubError, Result};
pub use hash::ContentHash;
pub use hub::{
    AttachConfig, ChannelConfig, ChannelPolicy, Consumer, Producer, ReadSlot, ReadValidity,
    SlotIter, WriteSlot,
};
pub use metrics::ChannelMetrics;
pub use recovery::{
    cleanup_stale_channels, force_reset, open_for_diagnostic, release_zombie_readers,
    release_zombie_writer, validate_integrity, DiagnosticView, IntegrityReport,
};
pub use schema::{FieldDescriptor, SchemaDescriptor, TypeTag};
