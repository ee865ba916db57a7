// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record schema descriptors and their canonical identity hash.
//!
//! A schema describes a trivially-copyable record as an ordered list of
//! `(field_name, offset, size, type_tag)`. The canonical 32-byte hash is
//! BLAKE2b-256 over the little-endian encoding
//!
//! ```text
//! version || record_size || alignment || sum(len(name) || name || offset || size || type_tag)
//! ```
//!
//! Two schemas hash equally iff they describe byte-identical layouts with
//! identical field names in identical order. The hash is the attach-time
//! compatibility token; renaming a field or reordering two fields produces a
//! different channel identity on purpose.

use crate::hash::ContentHash;

/// Primitive kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Bool = 1,
    U8 = 2,
    I8 = 3,
    U16 = 4,
    I16 = 5,
    U32 = 6,
    I32 = 7,
    U64 = 8,
    I64 = 9,
    F32 = 10,
    F64 = 11,
    /// Fixed-size byte array
    Bytes = 12,
}

/// One field of a record layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name; part of the identity
    pub name: String,
    /// Byte offset within the record
    pub offset: u64,
    /// Byte size of the field
    pub size: u64,
    /// Primitive kind
    pub type_tag: TypeTag,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, offset: u64, size: u64, type_tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            type_tag,
        }
    }
}

/// Description of one trivially-copyable record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    /// Schema format version; bumped on canonical-encoding changes
    pub version: u16,
    /// Total record size in bytes
    pub record_size: u64,
    /// Required alignment of the record
    pub alignment: u64,
    /// Ordered fields
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    /// Current schema format version.
    pub const VERSION: u16 = 1;

    /// New descriptor for a record of `record_size` bytes aligned to
    /// `alignment`.
    #[must_use]
    pub fn new(record_size: u64, alignment: u64) -> Self {
        Self {
            version: Self::VERSION,
            record_size,
            alignment,
            fields: Vec::new(),
        }
    }

    /// Append a field. Fields must be pushed in declaration order; the order
    /// is part of the identity.
    #[must_use]
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        offset: u64,
        size: u64,
        type_tag: TypeTag,
    ) -> Self {
        self.fields
            .push(FieldDescriptor::new(name, offset, size, type_tag));
        self
    }

    /// Canonical identity hash (see module docs for the encoding).
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        let mut buf = Vec::with_capacity(32 + self.fields.len() * 32);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.record_size.to_le_bytes());
        buf.extend_from_slice(&self.alignment.to_le_bytes());
        for field in &self.fields {
            buf.extend_from_slice(&(field.name.len() as u64).to_le_bytes());
            buf.extend_from_slice(field.name.as_bytes());
            buf.extend_from_slice(&field.offset.to_le_bytes());
            buf.extend_from_slice(&field.size.to_le_bytes());
            buf.push(field.type_tag as u8);
        }
        ContentHash::compute(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SchemaDescriptor {
        SchemaDescriptor::new(16, 8)
            .with_field("timestamp", 0, 8, TypeTag::U64)
            .with_field("value", 8, 8, TypeTag::F64)
    }

    #[test]
    fn test_hash_stable_across_registrations() {
        assert_eq!(sample().hash(), sample().hash());
    }

    #[test]
    fn test_field_name_is_part_of_identity() {
        let renamed = SchemaDescriptor::new(16, 8)
            .with_field("timestamp", 0, 8, TypeTag::U64)
            .with_field("reading", 8, 8, TypeTag::F64);
        assert_ne!(sample().hash(), renamed.hash());
    }

    #[test]
    fn test_field_order_is_part_of_identity() {
        let swapped = SchemaDescriptor::new(16, 8)
            .with_field("value", 8, 8, TypeTag::F64)
            .with_field("timestamp", 0, 8, TypeTag::U64);
        assert_ne!(sample().hash(), swapped.hash());
    }

    #[test]
    fn test_layout_is_part_of_identity() {
        let wider = SchemaDescriptor::new(24, 8)
            .with_field("timestamp", 0, 8, TypeTag::U64)
            .with_field("value", 8, 8, TypeTag::F64);
        assert_ne!(sample().hash(), wider.hash());
    }

    #[test]
    fn test_empty_schema_hashes() {
        let a = SchemaDescriptor::new(0, 1);
        let b = SchemaDescriptor::new(0, 1);
        assert_eq!(a.hash(), b.hash());
        assert!(!a.hash().is_zero());
    }
}
