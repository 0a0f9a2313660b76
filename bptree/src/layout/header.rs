//! Tree header.
//!
//! ```text
//! [byte_length: u32]          total tree size, free space included
//! [flags: u8]                 FLAG_* bits
//! [max_entries_per_node: u8]
//! [fill_factor: u8]           if FLAG_HAS_FILL_FACTOR
//! [free_byte_length: u32]     if FLAG_HAS_FREE_SPACE, trailing free bytes
//! [table_length: u32]         if FLAG_HAS_METADATA, bytes that follow
//! [key_count: u8]
//! ([name_length: u8][name])*
//! ```
//!
//! The root record starts immediately after the header, so the header length
//! never changes once the tree is written.

#![allow(clippy::cast_possible_truncation)]

use super::{
    Cursor, FLAG_HAS_FILL_FACTOR, FLAG_HAS_FREE_SPACE, FLAG_HAS_LARGE_PTRS, FLAG_HAS_METADATA,
    FLAG_HAS_SMALL_LEAFS, FLAG_UNIQUE_KEYS, LayoutError, PointerWidth, RecordFormat,
};

/// Bytes that always suffice to compute the full header length.
pub const HEADER_PREFIX_LENGTH: usize = 15;

/// Decoded tree header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHeader {
    pub byte_length: u32,
    pub unique: bool,
    pub has_free_space: bool,
    pub has_fill_factor: bool,
    pub small_leafs: bool,
    pub large_ptrs: bool,
    pub max_entries_per_node: u8,
    /// Percentage; 100 when the header does not record one.
    pub fill_factor: u8,
    pub free_byte_length: u32,
    pub metadata_keys: Vec<String>,
}

impl TreeHeader {
    /// Header for a tree in the current format. Lengths are filled in by the writer.
    #[must_use]
    pub const fn new(
        unique: bool,
        max_entries_per_node: u8,
        fill_factor: u8,
        metadata_keys: Vec<String>,
    ) -> Self {
        Self {
            byte_length: 0,
            unique,
            has_free_space: true,
            has_fill_factor: true,
            small_leafs: true,
            large_ptrs: true,
            max_entries_per_node,
            fill_factor,
            free_byte_length: 0,
            metadata_keys,
        }
    }

    #[must_use]
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        for (set, bit) in [
            (self.unique, FLAG_UNIQUE_KEYS),
            (!self.metadata_keys.is_empty(), FLAG_HAS_METADATA),
            (self.has_free_space, FLAG_HAS_FREE_SPACE),
            (self.has_fill_factor, FLAG_HAS_FILL_FACTOR),
            (self.small_leafs, FLAG_HAS_SMALL_LEAFS),
            (self.large_ptrs, FLAG_HAS_LARGE_PTRS),
        ] {
            if set {
                flags |= bit;
            }
        }
        flags
    }

    fn metadata_table_length(&self) -> usize {
        1 + self.metadata_keys.iter().map(|k| 1 + k.len()).sum::<usize>()
    }

    /// Encoded header length, which is also the root record's position.
    #[must_use]
    pub fn length(&self) -> usize {
        let mut len = 6;
        if self.has_fill_factor {
            len += 1;
        }
        if self.has_free_space {
            len += 4;
        }
        if !self.metadata_keys.is_empty() {
            len += 4 + self.metadata_table_length();
        }
        len
    }

    #[must_use]
    pub fn root_index(&self) -> u64 {
        self.length() as u64
    }

    /// Bytes in use, trailing free space excluded.
    #[must_use]
    pub const fn used_length(&self) -> u32 {
        self.byte_length.saturating_sub(self.free_byte_length)
    }

    #[must_use]
    pub const fn pointer_width(&self) -> PointerWidth {
        if self.large_ptrs {
            PointerWidth::Large
        } else {
            PointerWidth::Legacy
        }
    }

    #[must_use]
    pub fn format(&self) -> RecordFormat {
        RecordFormat {
            width: self.pointer_width(),
            unique: self.unique,
            small_leafs: self.small_leafs,
            metadata_count: self.metadata_keys.len(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, LayoutError> {
        let mut out = Vec::with_capacity(self.length());
        out.extend_from_slice(&self.byte_length.to_be_bytes());
        out.push(self.flags());
        out.push(self.max_entries_per_node);
        if self.has_fill_factor {
            out.push(self.fill_factor);
        }
        if self.has_free_space {
            out.extend_from_slice(&self.free_byte_length.to_be_bytes());
        }
        if !self.metadata_keys.is_empty() {
            let count = u8::try_from(self.metadata_keys.len()).map_err(|_| {
                LayoutError::InvalidMetadata(format!(
                    "{} metadata keys exceed 255",
                    self.metadata_keys.len()
                ))
            })?;
            out.extend_from_slice(&(self.metadata_table_length() as u32).to_be_bytes());
            out.push(count);
            for name in &self.metadata_keys {
                let len = u8::try_from(name.len()).map_err(|_| {
                    LayoutError::InvalidMetadata(format!("metadata key name {name:?} too long"))
                })?;
                out.push(len);
                out.extend_from_slice(name.as_bytes());
            }
        }
        Ok(out)
    }

    /// Full header length, computed from its first [`HEADER_PREFIX_LENGTH`] bytes.
    pub fn required_length(prefix: &[u8]) -> Result<usize, LayoutError> {
        let mut cursor = Cursor::new(prefix);
        cursor.u32()?;
        let flags = cursor.u8()?;
        cursor.u8()?;
        if flags & FLAG_HAS_FILL_FACTOR != 0 {
            cursor.u8()?;
        }
        if flags & FLAG_HAS_FREE_SPACE != 0 {
            cursor.u32()?;
        }
        if flags & FLAG_HAS_METADATA == 0 {
            return Ok(cursor.position());
        }
        let table_length = cursor.u32()? as usize;
        Ok(cursor.position() + table_length)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        let mut cursor = Cursor::new(bytes);
        let byte_length = cursor.u32()?;
        let flags = cursor.u8()?;
        let max_entries_per_node = cursor.u8()?;
        let has_fill_factor = flags & FLAG_HAS_FILL_FACTOR != 0;
        let fill_factor = if has_fill_factor { cursor.u8()? } else { 100 };
        let has_free_space = flags & FLAG_HAS_FREE_SPACE != 0;
        let free_byte_length = if has_free_space { cursor.u32()? } else { 0 };

        let mut metadata_keys = Vec::new();
        if flags & FLAG_HAS_METADATA != 0 {
            let table_length = cursor.u32()? as usize;
            let table_start = cursor.position();
            let count = cursor.u8()?;
            for _ in 0..count {
                let len = cursor.u8()? as usize;
                let name = std::str::from_utf8(cursor.take(len)?)
                    .map_err(|_| LayoutError::InvalidMetadata("key name is not UTF-8".into()))?;
                metadata_keys.push(name.to_string());
            }
            let actual = cursor.position() - table_start;
            if actual != table_length {
                return Err(LayoutError::InvalidByteLength {
                    expected: table_length,
                    actual,
                });
            }
        }

        if free_byte_length > byte_length {
            return Err(LayoutError::InvalidByteLength {
                expected: byte_length as usize,
                actual: free_byte_length as usize,
            });
        }

        Ok(Self {
            byte_length,
            unique: flags & FLAG_UNIQUE_KEYS != 0,
            has_free_space,
            has_fill_factor,
            small_leafs: flags & FLAG_HAS_SMALL_LEAFS != 0,
            large_ptrs: flags & FLAG_HAS_LARGE_PTRS != 0,
            max_entries_per_node,
            fill_factor,
            free_byte_length,
            metadata_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_with_metadata() {
        let mut header = TreeHeader::new(false, 255, 95, vec!["age".into(), "name".into()]);
        header.byte_length = 4096;
        header.free_byte_length = 100;
        let bytes = header.encode().expect("encode");
        assert_eq!(bytes.len(), header.length());
        assert_eq!(
            TreeHeader::required_length(&bytes[..HEADER_PREFIX_LENGTH]).expect("length"),
            bytes.len()
        );
        let decoded = TreeHeader::decode(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.used_length(), 3996);
        assert_eq!(decoded.metadata_keys, vec!["age", "name"]);
    }

    #[test]
    fn test_minimal_legacy_header() {
        // byte_length, flags (unique only), max entries
        let bytes = [0, 0, 1, 0, FLAG_UNIQUE_KEYS, 10];
        assert_eq!(TreeHeader::required_length(&bytes).expect("length"), 6);
        let header = TreeHeader::decode(&bytes).expect("decode");
        assert!(header.unique);
        assert!(!header.large_ptrs);
        assert_eq!(header.fill_factor, 100);
        assert_eq!(header.free_byte_length, 0);
        assert_eq!(header.pointer_width(), PointerWidth::Legacy);
        assert_eq!(header.root_index(), 6);
    }

    #[test]
    fn test_free_length_beyond_tree_rejected() {
        let mut header = TreeHeader::new(true, 10, 100, Vec::new());
        header.byte_length = 10;
        header.free_byte_length = 20;
        let bytes = header.encode().expect("encode");
        assert!(matches!(
            TreeHeader::decode(&bytes),
            Err(LayoutError::InvalidByteLength { .. })
        ));
    }
}
