// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BLAKE2b-256 content hashing.
//!
//! Every checksum stored in a segment (per-slot payload, flexible zone,
//! schema identity) is a 32-byte BLAKE2b-256 digest. The hash doubles as the
//! schema compatibility token: two descriptors are compatible iff their
//! digests are byte-identical.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// Digest width in bytes.
pub const CONTENT_HASH_LEN: usize = 32;

/// 32-byte BLAKE2b-256 digest newtype.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    /// Wrap a raw 32-byte digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// All-zero hash. Marks "no schema configured" in the header.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; CONTENT_HASH_LEN])
    }

    /// True for the all-zero hash.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; CONTENT_HASH_LEN]
    }

    /// Compute the BLAKE2b-256 digest of `data`.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        let digest = hasher.finalize();

        let mut bytes = [0u8; CONTENT_HASH_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Recompute over `data` and compare against this digest.
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; CONTENT_HASH_LEN]> for ContentHash {
    fn from(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = ContentHash::compute(b"payload");
        let b = ContentHash::compute(b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_inputs_differ() {
        let a = ContentHash::compute(b"payload");
        let b = ContentHash::compute(b"payloae");
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify() {
        let h = ContentHash::compute(b"abc");
        assert!(h.verify(b"abc"));
        assert!(!h.verify(b"abd"));
    }

    #[test]
    fn test_zero_is_zero() {
        assert!(ContentHash::zero().is_zero());
        assert!(!ContentHash::compute(b"").is_zero());
    }

    #[test]
    fn test_display_is_hex() {
        let h = ContentHash::zero();
        assert_eq!(h.to_string(), "0".repeat(64));
    }
}
