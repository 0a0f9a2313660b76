//! Binary tree layout.
//!
//! A tree is one contiguous byte range: a header, the root record immediately
//! after it, then node and leaf records in any order, then trailing free space.
//! Records reference each other with signed offsets relative to the field that
//! holds them, so the whole range can be moved without rewriting pointers.
//!
//! # Relative pointers
//!
//! A pointer field of width `w` stored at absolute position `p` addresses
//! `p + w - 1 + offset`. For the default 48-bit pointers the anchor is therefore
//! 5 bytes after the start of the field. A sibling pointer of 0 means "none";
//! a real target can never be the pointer's own last byte.
//!
//! All multi-byte integers are big-endian.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod header;
pub mod leaf;
pub mod node;
pub mod serializer;

pub use header::TreeHeader;
pub use leaf::{EncodedLeaf, ExtPointer, ExtRegion, LeafRecord, LeafRecordEntry, LeafValues};
pub use node::{NodeEntry, NodeRecord};

use crate::entry::EntryError;
use crate::key::{KeyError, MAX_ENCODED_KEY_LENGTH};

/// Header flag: keys are unique, each key holds exactly one value.
pub const FLAG_UNIQUE_KEYS: u8 = 0x01;
/// Header flag: a metadata key table follows the fixed header fields.
pub const FLAG_HAS_METADATA: u8 = 0x02;
/// Header flag: the header records the trailing free byte length.
pub const FLAG_HAS_FREE_SPACE: u8 = 0x04;
/// Header flag: the header records a fill factor.
pub const FLAG_HAS_FILL_FACTOR: u8 = 0x08;
/// Header flag: leaves use the 1-byte small value header and extension data.
pub const FLAG_HAS_SMALL_LEAFS: u8 = 0x10;
/// Header flag: pointers are 48 bits wide. Trees without it are read-only.
pub const FLAG_HAS_LARGE_PTRS: u8 = 0x20;

/// Record flag: the record is a leaf.
pub const RECORD_FLAG_IS_LEAF: u8 = 0x01;
/// Record flag: the leaf owns an extension region.
pub const RECORD_FLAG_HAS_EXT_DATA: u8 = 0x02;

/// Value header bit marking a value list stored in the extension region.
pub const SMALL_VALUE_EXT_FLAG: u8 = 0x80;
/// Largest length a small value header can describe.
pub const MAX_SMALL_VALUE_LENGTH: usize = 0x7F;
/// Largest value byte count (count prefix excluded) kept inline in a leaf.
pub const MAX_INLINE_VALUE_BYTES: usize = MAX_SMALL_VALUE_LENGTH - 4;

/// Growth estimate per missing entry when a record has no entries to average.
pub const DEFAULT_ENTRY_ESTIMATE: usize = 32;

/// Errors raised while encoding or decoding records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Buffer ended in the middle of a record.
    UnexpectedEnd { needed: usize, available: usize },
    /// A length field disagrees with the data around it.
    InvalidByteLength { expected: usize, actual: usize },
    /// Expected a node or leaf record but found the other kind.
    UnexpectedRecord { index: u64, expected_leaf: bool },
    /// Relative offset does not fit the pointer width or points before the tree.
    OffsetOutOfRange { offset: i64 },
    /// More entries than a record's 1-byte count can hold.
    TooManyEntries { count: usize },
    /// Leaf contents exceed its allocated primary region.
    LeafTooSmall { needed: usize, available: usize },
    /// Leaf value lists exceed its allocated extension region.
    ExtTooSmall { needed: usize, available: usize },
    /// A value list cannot be kept inline and must move to extension data.
    NeedsExtData,
    /// Node contents exceed its allocation.
    NodeTooSmall { needed: usize, available: usize },
    /// Header metadata table is malformed.
    InvalidMetadata(String),
    Key(KeyError),
    Entry(EntryError),
}

impl LayoutError {
    /// True for errors that a bigger allocation would resolve.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::LeafTooSmall { .. }
                | Self::ExtTooSmall { .. }
                | Self::NeedsExtData
                | Self::NodeTooSmall { .. }
        )
    }
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEnd { needed, available } => write!(
                f,
                "unexpected end of data: needed {needed} bytes, {available} available"
            ),
            Self::InvalidByteLength { expected, actual } => {
                write!(f, "invalid byte length: expected {expected}, found {actual}")
            }
            Self::UnexpectedRecord {
                index,
                expected_leaf,
            } => {
                let kind = if *expected_leaf { "leaf" } else { "node" };
                write!(f, "record at {index} is not a {kind}")
            }
            Self::OffsetOutOfRange { offset } => write!(f, "offset {offset} out of range"),
            Self::TooManyEntries { count } => write!(f, "{count} entries exceed 255"),
            Self::LeafTooSmall { needed, available } => write!(
                f,
                "leaf needs {needed} bytes but has {available}"
            ),
            Self::ExtTooSmall { needed, available } => write!(
                f,
                "leaf extension data needs {needed} bytes but has {available}"
            ),
            Self::NeedsExtData => write!(f, "value list too large to store inline"),
            Self::NodeTooSmall { needed, available } => write!(
                f,
                "node needs {needed} bytes but has {available}"
            ),
            Self::InvalidMetadata(msg) => write!(f, "invalid metadata table: {msg}"),
            Self::Key(e) => write!(f, "key: {e}"),
            Self::Entry(e) => write!(f, "value: {e}"),
        }
    }
}

impl std::error::Error for LayoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(e) => Some(e),
            Self::Entry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KeyError> for LayoutError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<EntryError> for LayoutError {
    fn from(e: EntryError) -> Self {
        Self::Entry(e)
    }
}

/// Width of pointer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    /// 32-bit pointers of trees written before large pointer support.
    Legacy,
    /// 48-bit pointers.
    Large,
}

impl PointerWidth {
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Legacy => 4,
            Self::Large => 6,
        }
    }

    const fn bits(self) -> u32 {
        (self.bytes() * 8) as u32
    }
}

/// Signed offset stored in a pointer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeOffset(i64);

impl RelativeOffset {
    /// The "no target" sibling pointer.
    pub const NONE: Self = Self(0);

    const fn anchor(field_position: u64, width: PointerWidth) -> i64 {
        (field_position + width.bytes() as u64 - 1) as i64
    }

    /// Offset from the field at `field_position` to `target`.
    pub fn between(
        field_position: u64,
        target: u64,
        width: PointerWidth,
    ) -> Result<Self, LayoutError> {
        let offset = target as i64 - Self::anchor(field_position, width);
        let limit = 1i64 << (width.bits() - 1);
        if offset < -limit || offset >= limit {
            return Err(LayoutError::OffsetOutOfRange { offset });
        }
        Ok(Self(offset))
    }

    /// Absolute target of this offset when stored at `field_position`.
    pub fn resolve(self, field_position: u64, width: PointerWidth) -> Result<u64, LayoutError> {
        let target = Self::anchor(field_position, width) + self.0;
        u64::try_from(target).map_err(|_| LayoutError::OffsetOutOfRange { offset: self.0 })
    }

    /// Appends the offset as a two's complement big-endian integer of `width` bytes.
    pub fn write(self, width: PointerWidth, out: &mut Vec<u8>) {
        let bytes = self.0.to_be_bytes();
        out.extend_from_slice(&bytes[8 - width.bytes()..]);
    }

    /// Reads a sign-extended offset of `width` bytes.
    #[must_use]
    pub fn read(bytes: &[u8], width: PointerWidth) -> Self {
        let n = width.bytes();
        let fill = if bytes[0] & 0x80 == 0 { 0x00 } else { 0xFF };
        let mut buf = [fill; 8];
        buf[8 - n..].copy_from_slice(&bytes[..n]);
        Self(i64::from_be_bytes(buf))
    }

    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

/// Encodes a pointer field for `target` (or "none") stored at `field_position`.
pub fn encode_pointer(
    field_position: u64,
    target: Option<u64>,
    width: PointerWidth,
) -> Result<Vec<u8>, LayoutError> {
    let offset = match target {
        Some(t) => RelativeOffset::between(field_position, t, width)?,
        None => RelativeOffset::NONE,
    };
    let mut out = Vec::with_capacity(width.bytes());
    offset.write(width, &mut out);
    Ok(out)
}

/// Tree-wide parameters needed to read and write records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    pub width: PointerWidth,
    pub unique: bool,
    pub small_leafs: bool,
    pub metadata_count: usize,
}

impl RecordFormat {
    /// Format written by this crate.
    #[must_use]
    pub const fn current(unique: bool, metadata_count: usize) -> Self {
        Self {
            width: PointerWidth::Large,
            unique,
            small_leafs: true,
            metadata_count,
        }
    }
}

/// Bounds-checked big-endian reader over a record buffer.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], LayoutError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(LayoutError::UnexpectedEnd {
                needed: self.pos + n,
                available: self.bytes.len(),
            })?;
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, LayoutError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, LayoutError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn offset(&mut self, width: PointerWidth) -> Result<RelativeOffset, LayoutError> {
        Ok(RelativeOffset::read(self.take(width.bytes())?, width))
    }

    pub(crate) fn key(&mut self) -> Result<crate::key::Key, LayoutError> {
        let (key, used) = crate::key::Key::decode(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok(key)
    }
}

/// Free bytes to reserve so a record holding `count` entries of `used` bytes
/// can grow to `capacity` entries.
#[must_use]
pub fn growth_bytes(used: usize, count: usize, capacity: usize) -> usize {
    let per_entry = if count == 0 {
        DEFAULT_ENTRY_ESTIMATE
    } else {
        used.div_ceil(count)
    };
    per_entry * capacity.saturating_sub(count)
}

/// Spare capacity given to an extension block holding `data` bytes.
#[must_use]
pub const fn ext_block_growth(data: usize) -> usize {
    data / 4 + 32
}

/// Smallest footprint a root leaf may have so it can turn into a one-entry
/// root node in place.
#[must_use]
pub const fn min_root_length(width: PointerWidth) -> usize {
    node::NODE_HEADER_LENGTH + MAX_ENCODED_KEY_LENGTH + 2 * width.bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_offset_anchor() {
        let width = PointerWidth::Large;
        let off = RelativeOffset::between(100, 200, width).expect("offset");
        // anchor = 100 + 5
        assert_eq!(off.value(), 95);
        assert_eq!(off.resolve(100, width).expect("resolve"), 200);

        let back = RelativeOffset::between(500, 20, width).expect("offset");
        assert_eq!(back.resolve(500, width).expect("resolve"), 20);
    }

    #[test]
    fn test_negative_offset_sign_extension() {
        for width in [PointerWidth::Legacy, PointerWidth::Large] {
            let off = RelativeOffset::between(1000, 10, width).expect("offset");
            let mut buf = Vec::new();
            off.write(width, &mut buf);
            assert_eq!(buf.len(), width.bytes());
            assert_eq!(RelativeOffset::read(&buf, width), off);
        }
    }

    #[test]
    fn test_offset_range_checked() {
        let huge = 1u64 << 40;
        assert!(RelativeOffset::between(0, huge, PointerWidth::Large).is_ok());
        assert!(matches!(
            RelativeOffset::between(0, huge, PointerWidth::Legacy),
            Err(LayoutError::OffsetOutOfRange { .. })
        ));
        assert!(RelativeOffset::NONE.resolve(0, PointerWidth::Large).is_ok());
        assert!(RelativeOffset(-10).resolve(0, PointerWidth::Large).is_err());
    }

    #[test]
    fn test_growth_bytes() {
        assert_eq!(growth_bytes(100, 4, 10), 25 * 6);
        assert_eq!(growth_bytes(0, 0, 2), 2 * DEFAULT_ENTRY_ESTIMATE);
        assert_eq!(growth_bytes(10, 12, 10), 0);
    }
}
