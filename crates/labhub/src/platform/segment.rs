// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating and
//! mapping channel segments.
//!
//! # Segment Lifecycle
//!
//! 1. Producer creates the segment with [`ShmSegment::create`]
//! 2. Consumers open it with [`ShmSegment::open`]
//! 3. The mapping is released on drop
//! 4. The producer calls [`ShmSegment::unlink`] on teardown
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`. Channel names
//! chosen by callers are sanitised and prefixed, e.g. channel `imaging/raw`
//! becomes `/labhub_imaging_raw`.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// Vendor prefix prepended to every channel segment.
pub const SEGMENT_NAME_PREFIX: &str = "/labhub_";

/// POSIX shared memory segment wrapper.
///
/// Unmaps the region on drop. Does NOT unlink automatically; the creator
/// owns the name.
pub struct ShmSegment {
    /// Mapped region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name (for unlink)
    name: String,
}

// SAFETY: the pointer refers to shared memory accessed from multiple
// threads and processes; all cross-party coordination in that memory goes
// through atomic operations in the layers above.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment of `size` bytes, zero-filled.
    ///
    /// Fails with [`ShmError::AlreadyExists`] if the name is taken; stale
    /// segments must be reclaimed explicitly by the caller, never clobbered
    /// here.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; O_CREAT|O_EXCL
        // either creates a fresh object or fails with EEXIST; mode 0o600
        // restricts the object to the owning user. The fd is checked below.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Err(ShmError::AlreadyExists(name.to_string()));
            }
            return Err(ShmError::SegmentCreate(err));
        }

        // SAFETY: fd is a valid descriptor from the shm_open above; a too
        // large size makes ftruncate fail, handled below.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used again on this error path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = Self::map(fd, size);

        // SAFETY: fd is valid; the mapping (if any) holds its own reference,
        // so closing is safe whether mmap succeeded or not.
        unsafe { libc::close(fd) };

        let ptr = match ptr {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: unlinking a name we just created only touches the
                // filesystem namespace.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        // SAFETY: ptr points to exactly `size` freshly mapped writable
        // bytes with no other references yet.
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing segment and map `size` bytes of it.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; O_RDWR opens the
        // existing object (consumers still need write access for atomics in
        // the header). The fd is checked below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let ptr = Self::map(fd, size);

        // SAFETY: fd is valid; the mapping keeps its own reference.
        unsafe { libc::close(fd) };

        Ok(Self {
            ptr: ptr?,
            size,
            name: name.to_string(),
        })
    }

    /// mmap `size` bytes of `fd` read-write, shared.
    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: null hint lets the kernel place the mapping; fd is a valid
        // shm object descriptor; PROT_READ|PROT_WRITE with MAP_SHARED is the
        // required mode for cross-process atomics. MAP_FAILED is checked.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    /// Validate a segment name against POSIX rules.
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "Segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a segment by name. Removal completes once every
    /// process has unmapped it. Not-found is treated as success so cleanup
    /// stays idempotent.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: shm_unlink only touches the filesystem namespace; calling
        // it on a missing name is harmless and handled below.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }

        Ok(())
    }

    /// Raw pointer to the mapped region.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a segment with this name exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };

        // SAFETY: c_name is valid; O_RDONLY existence probe only.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };

        if fd >= 0 {
            // SAFETY: fd is valid and not used again.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in create()/open()
        // and Drop runs once. The name is intentionally left linked.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Segment name for a user-supplied channel name.
///
/// Prepends the vendor prefix and replaces anything outside
/// `[A-Za-z0-9_.-]` with `_` so the result satisfies the host's shm naming
/// rules. Long names are truncated to the POSIX limit.
#[must_use]
pub fn channel_segment_name(channel: &str) -> String {
    let sanitised: String = channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut name = format!("{SEGMENT_NAME_PREFIX}{sanitised}");
    name.truncate(255);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/labhub_test_{ts}")
    }

    #[test]
    fn test_validate_name_valid() {
        assert!(ShmSegment::validate_name("/foo").is_ok());
        assert!(ShmSegment::validate_name("/labhub_sensor.raw").is_ok());
    }

    #[test]
    fn test_validate_name_no_leading_slash() {
        assert!(ShmSegment::validate_name("foo").is_err());
    }

    #[test]
    fn test_validate_name_embedded_slash() {
        assert!(ShmSegment::validate_name("/foo/bar").is_err());
    }

    #[test]
    fn test_create_and_open() {
        let name = unique_name();
        let size = 4096;

        let seg1 = ShmSegment::create(&name, size).expect("Failed to create");
        assert_eq!(seg1.size(), size);

        // SAFETY: seg1 maps `size` bytes, offsets 0 and 1 are in bounds.
        unsafe {
            *seg1.as_ptr() = 0x42;
            *seg1.as_ptr().add(1) = 0x43;
        }

        let seg2 = ShmSegment::open(&name, size).expect("Failed to open");

        // SAFETY: seg2 maps the same object; offsets written above.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
            assert_eq!(*seg2.as_ptr().add(1), 0x43);
        }

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_create_refuses_existing() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("Failed to create");

        let second = ShmSegment::create(&name, 4096);
        assert!(matches!(second, Err(ShmError::AlreadyExists(_))));

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_nonexistent() {
        let result = ShmSegment::open("/labhub_nonexistent_12345", 4096);
        assert!(matches!(result, Err(ShmError::NotFound(_))));
    }

    #[test]
    fn test_exists() {
        let name = unique_name();

        assert!(!ShmSegment::exists(&name));

        let _seg = ShmSegment::create(&name, 4096).expect("Failed to create");
        assert!(ShmSegment::exists(&name));

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_unlink_idempotent() {
        let name = unique_name();

        let _seg = ShmSegment::create(&name, 4096).expect("Failed to create");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }

    #[test]
    fn test_channel_segment_name_sanitises() {
        assert_eq!(channel_segment_name("imaging/raw"), "/labhub_imaging_raw");
        assert_eq!(channel_segment_name("t1"), "/labhub_t1");
        assert_eq!(channel_segment_name("a b:c"), "/labhub_a_b_c");
    }
}
