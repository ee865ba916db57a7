// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hub error taxonomy with stable wire codes.
//!
//! Attachment errors are fatal to the attach attempt and never mutate shared
//! state. Runtime errors on acquire are recoverable and leave counters
//! updated. Integrity errors invalidate a single read without poisoning the
//! channel. Corruption that cannot be explained by normal concurrency
//! surfaces as `StateInvalid` and is only cleared by a force reset.

use crate::platform::ShmError;
use std::fmt;

/// Errors produced by hub operations.
///
/// Each variant maps to a stable `u32` code via [`HubError::code`]; the codes
/// are part of the external interface and must not be renumbered.
#[derive(Debug)]
pub enum HubError {
    /// Header magic does not match `PYLBHUB\0`
    BadMagic,

    /// Major version of the segment differs from ours
    VersionMismatch { expected: u16, actual: u16 },

    /// Shared secret did not match the one stored in the header
    AuthFailed,

    /// Schema hash comparison failed at attach
    SchemaMismatch { zone: &'static str },

    /// Slot or flexible-zone geometry differs from the caller's expectation
    ConfigMismatch(String),

    /// All consumer heartbeat entries are in use
    HeartbeatPoolExhausted,

    /// A blocking acquire ran out of time
    Timeout,

    /// The producer evicted readers (or a reader lost its slot) to make progress
    Overrun,

    /// Payload checksum mismatch on a committed slot or the flexible zone
    IntegrityFailure,

    /// Shared state is inconsistent beyond what concurrency can explain
    StateInvalid(String),

    /// No channel with this name exists
    NotFound(String),

    /// The resource is held by a live peer
    Busy(String),

    /// Platform-level shared memory failure
    Platform(ShmError),
}

impl HubError {
    /// Stable error code for the C boundary and the broker wire.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::BadMagic => 1,
            Self::VersionMismatch { .. } => 2,
            Self::AuthFailed => 3,
            Self::SchemaMismatch { .. } => 4,
            Self::ConfigMismatch(_) => 5,
            Self::HeartbeatPoolExhausted => 6,
            Self::Timeout => 7,
            Self::Overrun => 8,
            Self::IntegrityFailure => 9,
            Self::StateInvalid(_) => 10,
            Self::NotFound(_) | Self::Platform(ShmError::NotFound(_)) => 11,
            Self::Busy(_) => 12,
            Self::Platform(_) => 10,
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "Header magic mismatch (not a labhub segment)"),
            Self::VersionMismatch { expected, actual } => {
                write!(f, "Version mismatch: expected major {expected}, found {actual}")
            }
            Self::AuthFailed => write!(f, "Shared secret rejected"),
            Self::SchemaMismatch { zone } => write!(f, "Schema hash mismatch for {zone}"),
            Self::ConfigMismatch(what) => write!(f, "Channel config mismatch: {what}"),
            Self::HeartbeatPoolExhausted => write!(f, "Consumer heartbeat pool exhausted"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Overrun => write!(f, "Slot overrun"),
            Self::IntegrityFailure => write!(f, "Payload checksum mismatch"),
            Self::StateInvalid(what) => write!(f, "Shared state invalid: {what}"),
            Self::NotFound(name) => write!(f, "Channel not found: {name}"),
            Self::Busy(what) => write!(f, "Resource busy: {what}"),
            Self::Platform(e) => write!(f, "Platform error: {e}"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for HubError {
    fn from(e: ShmError) -> Self {
        Self::Platform(e)
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(HubError::BadMagic.code(), 1);
        assert_eq!(
            HubError::VersionMismatch {
                expected: 1,
                actual: 2
            }
            .code(),
            2
        );
        assert_eq!(HubError::AuthFailed.code(), 3);
        assert_eq!(HubError::SchemaMismatch { zone: "datablock" }.code(), 4);
        assert_eq!(HubError::ConfigMismatch(String::new()).code(), 5);
        assert_eq!(HubError::HeartbeatPoolExhausted.code(), 6);
        assert_eq!(HubError::Timeout.code(), 7);
        assert_eq!(HubError::Overrun.code(), 8);
        assert_eq!(HubError::IntegrityFailure.code(), 9);
        assert_eq!(HubError::StateInvalid(String::new()).code(), 10);
        assert_eq!(HubError::NotFound(String::new()).code(), 11);
        assert_eq!(HubError::Busy(String::new()).code(), 12);
    }

    #[test]
    fn test_platform_not_found_maps_to_not_found_code() {
        let err = HubError::Platform(ShmError::NotFound("/labhub_x".into()));
        assert_eq!(err.code(), 11);
    }
}
