// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Platform primitives: monotonic time, process liveness, POSIX shared
//! memory.
//!
//! Everything the hub needs from the OS lives here behind narrow functions,
//! so the coordination logic above never touches `libc` directly.

mod process;
mod segment;
mod time;

pub use process::{current_pid, is_pid_alive};
pub use segment::{channel_segment_name, ShmSegment, SEGMENT_NAME_PREFIX};
pub use time::monotonic_ns;

use std::fmt;
use std::io;

/// Errors from the shared memory platform layer.
#[derive(Debug)]
pub enum ShmError {
    /// Segment creation failed
    SegmentCreate(io::Error),

    /// Segment open failed
    SegmentOpen(io::Error),

    /// mmap failed
    Mmap(io::Error),

    /// Invalid segment name
    InvalidName(String),

    /// Segment not found
    NotFound(String),

    /// Segment already exists
    AlreadyExists(String),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::AlreadyExists(name) => write!(f, "Segment already exists: {name}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for platform operations.
pub type Result<T> = std::result::Result<T, ShmError>;
