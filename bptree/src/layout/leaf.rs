//! Leaf records and their extension data.
//!
//! ```text
//! [byte_length: u32][flags: u8][free_byte_length: u32]
//! [prev_leaf: ptr][next_leaf: ptr]
//! [ext_byte_length: u32][ext_free_byte_length: u32]   if RECORD_FLAG_HAS_EXT_DATA
//! [entry_count: u8]
//! ([key][value header][value data])*
//! [free bytes]
//! [extension region: ext_byte_length bytes]           if RECORD_FLAG_HAS_EXT_DATA
//! ```
//!
//! In trees with small leafs the value header is one byte. Its low 7 bits give
//! the length of an inline value list. With [`SMALL_VALUE_EXT_FLAG`] set, the
//! list lives in an extension block instead and the entry stores the value
//! count (non-unique trees only) and a `u32` pointer relative to the start of
//! the extension region. Trees without small leafs use a `u32` length header
//! and always store value lists inline.
//!
//! An extension block is `[block_length: u32][block_free: u32][data]` where
//! `block_length` is the data capacity and the first
//! `block_length - block_free` data bytes hold the value list.
//!
//! # Invariants
//!
//! - Entries are sorted ascending, at most 255 per leaf.
//! - The extension region immediately follows the primary region, so
//!   a leaf's footprint is `byte_length + ext_byte_length`.

#![allow(clippy::cast_possible_truncation)]

use super::{
    Cursor, LayoutError, MAX_INLINE_VALUE_BYTES, PointerWidth, RECORD_FLAG_HAS_EXT_DATA,
    RECORD_FLAG_IS_LEAF, RecordFormat, RelativeOffset, SMALL_VALUE_EXT_FLAG, encode_pointer,
    ext_block_growth, growth_bytes,
};
use crate::entry::{
    EntryValue, LeafEntry, VALUE_LIST_COUNT_SIZE, decode_value_list, encode_value_list,
    value_list_len, values_len,
};
use crate::key::Key;

/// Position of the previous-leaf pointer within a leaf record.
pub const LEAF_POINTERS_OFFSET: u64 = 9;

/// Size of an extension block's header.
pub const EXT_BLOCK_HEADER_LENGTH: usize = 8;

/// Location and size of a leaf's extension region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtRegion {
    pub length: u32,
    pub free_byte_length: u32,
}

/// Reference from a leaf entry to its value list in an extension block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtPointer {
    pub value_count: u32,
    /// Absolute position of the extension block.
    pub block_index: u64,
}

/// Values of a leaf entry as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValues {
    Inline(Vec<EntryValue>),
    External(ExtPointer),
}

/// A leaf entry as decoded, with possibly unloaded extension values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecordEntry {
    pub key: Key,
    pub values: LeafValues,
}

impl LeafRecordEntry {
    #[must_use]
    pub const fn value_count(&self) -> usize {
        match &self.values {
            LeafValues::Inline(values) => values.len(),
            LeafValues::External(ptr) => ptr.value_count as usize,
        }
    }

    /// Returns the entry if its values are loaded.
    #[must_use]
    pub fn to_leaf_entry(&self) -> Option<LeafEntry> {
        match &self.values {
            LeafValues::Inline(values) => Some(LeafEntry::new(self.key.clone(), values.clone())),
            LeafValues::External(_) => None,
        }
    }
}

impl From<LeafEntry> for LeafRecordEntry {
    fn from(entry: LeafEntry) -> Self {
        Self {
            key: entry.key,
            values: LeafValues::Inline(entry.values),
        }
    }
}

/// Encoded leaf: the primary region and, when present, the extension region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedLeaf {
    pub primary: Vec<u8>,
    pub ext: Option<Vec<u8>>,
}

impl EncodedLeaf {
    /// Both regions as one contiguous buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.primary;
        if let Some(ext) = self.ext {
            bytes.extend_from_slice(&ext);
        }
        bytes
    }
}

/// Space a set of entries needs in a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSize {
    /// Primary region bytes, header included.
    pub primary: usize,
    /// Bytes taken by entries alone.
    pub entries: usize,
    /// Extension block bytes, headers included.
    pub ext: usize,
}

impl LeafSize {
    /// Allocation for a leaf holding `count` entries that should have room to
    /// grow to `capacity` entries: `(byte_length, ext_byte_length)`.
    #[must_use]
    pub fn allocation(&self, count: usize, capacity: usize) -> (usize, usize) {
        let primary = self.primary + growth_bytes(self.entries, count, capacity);
        let ext = if self.ext == 0 {
            0
        } else {
            self.ext + self.ext / 2 + 64
        };
        (primary, ext)
    }
}

/// Decoded leaf record. Pointer targets are absolute within the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord {
    pub index: u64,
    pub byte_length: u32,
    pub free_byte_length: u32,
    pub prev_leaf: Option<u64>,
    pub next_leaf: Option<u64>,
    pub ext: Option<ExtRegion>,
    pub entries: Vec<LeafRecordEntry>,
}

const fn header_length(width: PointerWidth, has_ext: bool) -> usize {
    LEAF_POINTERS_OFFSET as usize + 2 * width.bytes() + if has_ext { 8 } else { 0 } + 1
}

/// Position of the previous-leaf pointer of the leaf at `index`.
#[must_use]
pub const fn prev_pointer_position(index: u64) -> u64 {
    index + LEAF_POINTERS_OFFSET
}

/// Position of the next-leaf pointer of the leaf at `index`.
#[must_use]
pub const fn next_pointer_position(index: u64, width: PointerWidth) -> u64 {
    index + LEAF_POINTERS_OFFSET + width.bytes() as u64
}

/// Encoded value list destined for an extension block.
struct PendingBlock {
    pointer_position: usize,
    payload: Vec<u8>,
}

impl LeafRecord {
    /// A new, unwritten leaf with the given allocation.
    #[must_use]
    pub const fn empty(index: u64, byte_length: u32, ext_length: u32) -> Self {
        Self {
            index,
            byte_length,
            free_byte_length: 0,
            prev_leaf: None,
            next_leaf: None,
            ext: if ext_length == 0 {
                None
            } else {
                Some(ExtRegion {
                    length: ext_length,
                    free_byte_length: ext_length,
                })
            },
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn ext_length(&self) -> u32 {
        self.ext.map_or(0, |e| e.length)
    }

    /// Bytes the leaf occupies, extension region included.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        u64::from(self.byte_length) + u64::from(self.ext_length())
    }

    /// Absolute position of the extension region.
    #[must_use]
    pub fn ext_start(&self) -> u64 {
        self.index + u64::from(self.byte_length)
    }

    #[must_use]
    pub fn first_key(&self) -> Option<&Key> {
        self.entries.first().map(|e| &e.key)
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&Key> {
        self.entries.last().map(|e| &e.key)
    }

    /// Binary search for `key` among the entries.
    pub fn search(&self, key: &Key) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }

    /// True when every entry has its values loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.values, LeafValues::Inline(_)))
    }

    /// Loaded entries, or `None` if any value list still lives in an extension block.
    #[must_use]
    pub fn loaded_entries(&self) -> Option<Vec<LeafEntry>> {
        self.entries.iter().map(LeafRecordEntry::to_leaf_entry).collect()
    }

    /// Measures the space `entries` need.
    #[must_use]
    pub fn measure(entries: &[LeafEntry], format: RecordFormat) -> LeafSize {
        let mut entries_len = 0;
        let mut ext = 0;
        for entry in entries {
            entries_len += entry.key.encoded_len();
            let payload = value_list_len(&entry.values, format.unique);
            if !format.small_leafs {
                entries_len += 4 + payload;
            } else if values_len(&entry.values) <= MAX_INLINE_VALUE_BYTES {
                entries_len += 1 + payload;
            } else {
                entries_len += external_entry_len(format.unique);
                ext += EXT_BLOCK_HEADER_LENGTH + payload;
            }
        }
        LeafSize {
            primary: header_length(format.width, ext > 0) + entries_len,
            entries: entries_len,
            ext,
        }
    }

    fn encode_header(
        &self,
        format: RecordFormat,
        content_len: usize,
        count: usize,
        ext: Option<ExtRegion>,
    ) -> Result<Vec<u8>, LayoutError> {
        if count > usize::from(u8::MAX) {
            return Err(LayoutError::TooManyEntries { count });
        }
        let total = self.byte_length as usize;
        if content_len > total {
            return Err(LayoutError::LeafTooSmall {
                needed: content_len,
                available: total,
            });
        }
        let width = format.width;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.byte_length.to_be_bytes());
        let flags = RECORD_FLAG_IS_LEAF | if ext.is_some() { RECORD_FLAG_HAS_EXT_DATA } else { 0 };
        out.push(flags);
        out.extend_from_slice(&((total - content_len) as u32).to_be_bytes());
        out.extend(encode_pointer(
            prev_pointer_position(self.index),
            self.prev_leaf,
            width,
        )?);
        out.extend(encode_pointer(
            next_pointer_position(self.index, width),
            self.next_leaf,
            width,
        )?);
        if let Some(region) = ext {
            out.extend_from_slice(&region.length.to_be_bytes());
            out.extend_from_slice(&region.free_byte_length.to_be_bytes());
        }
        out.push(count as u8);
        Ok(out)
    }

    /// Re-encodes the primary region only, keeping extension blocks where they are.
    ///
    /// Fails with [`LayoutError::NeedsExtData`] when an inline value list grew
    /// past the inline limit.
    pub fn encode_primary(&self, format: RecordFormat) -> Result<Vec<u8>, LayoutError> {
        let ext_start = self.ext_start();
        let mut body = Vec::new();
        for entry in &self.entries {
            entry.key.encode_into(&mut body)?;
            match &entry.values {
                LeafValues::Inline(values) => write_inline(&mut body, values, format)?,
                LeafValues::External(ptr) => {
                    let relative = ptr
                        .block_index
                        .checked_sub(ext_start)
                        .and_then(|r| u32::try_from(r).ok())
                        .ok_or(LayoutError::OffsetOutOfRange {
                            offset: ptr.block_index as i64,
                        })?;
                    body.push(SMALL_VALUE_EXT_FLAG);
                    if !format.unique {
                        body.extend_from_slice(&ptr.value_count.to_be_bytes());
                    }
                    body.extend_from_slice(&relative.to_be_bytes());
                }
            }
        }
        let content = header_length(format.width, self.ext.is_some()) + body.len();
        let mut out = self.encode_header(format, content, self.entries.len(), self.ext)?;
        out.extend_from_slice(&body);
        out.resize(self.byte_length as usize, 0);
        Ok(out)
    }

    /// Encodes `entries` into this leaf's allocation, rebuilding the extension
    /// region from scratch. `self.entries` is ignored.
    pub fn encode_full(
        &self,
        entries: &[LeafEntry],
        format: RecordFormat,
    ) -> Result<EncodedLeaf, LayoutError> {
        let ext_length = self.ext_length() as usize;
        let mut body = Vec::new();
        let mut blocks = Vec::new();
        for entry in entries {
            entry.key.encode_into(&mut body)?;
            if !format.small_leafs || values_len(&entry.values) <= MAX_INLINE_VALUE_BYTES {
                write_inline(&mut body, &entry.values, format)?;
                continue;
            }
            let mut payload = Vec::new();
            encode_value_list(&entry.values, format.unique, &mut payload)?;
            body.push(SMALL_VALUE_EXT_FLAG);
            if !format.unique {
                body.extend_from_slice(&(entry.values.len() as u32).to_be_bytes());
            }
            blocks.push(PendingBlock {
                pointer_position: body.len(),
                payload,
            });
            body.extend_from_slice(&[0; 4]);
        }

        let needed: usize = blocks
            .iter()
            .map(|b| EXT_BLOCK_HEADER_LENGTH + b.payload.len())
            .sum();
        if needed > ext_length || (!blocks.is_empty() && self.ext.is_none()) {
            return Err(LayoutError::ExtTooSmall {
                needed,
                available: ext_length,
            });
        }

        let ext = if self.ext.is_some() {
            let mut spare = ext_length - needed;
            let mut region = Vec::with_capacity(ext_length);
            for block in &blocks {
                let growth = ext_block_growth(block.payload.len()).min(spare);
                spare -= growth;
                let relative = (region.len() as u32).to_be_bytes();
                body[block.pointer_position..block.pointer_position + 4]
                    .copy_from_slice(&relative);
                region.extend(encode_ext_block(&block.payload, block.payload.len() + growth));
            }
            let free = ext_length - region.len();
            region.resize(ext_length, 0);
            Some((
                region,
                ExtRegion {
                    length: ext_length as u32,
                    free_byte_length: free as u32,
                },
            ))
        } else {
            None
        };

        let content = header_length(format.width, ext.is_some()) + body.len();
        let mut primary =
            self.encode_header(format, content, entries.len(), ext.as_ref().map(|(_, r)| *r))?;
        primary.extend_from_slice(&body);
        primary.resize(self.byte_length as usize, 0);
        Ok(EncodedLeaf {
            primary,
            ext: ext.map(|(bytes, _)| bytes),
        })
    }

    /// Decodes a leaf stored at `index` from its primary region bytes.
    pub fn decode(bytes: &[u8], index: u64, format: RecordFormat) -> Result<Self, LayoutError> {
        let width = format.width;
        let mut cursor = Cursor::new(bytes);
        let byte_length = cursor.u32()?;
        let flags = cursor.u8()?;
        if flags & RECORD_FLAG_IS_LEAF == 0 {
            return Err(LayoutError::UnexpectedRecord {
                index,
                expected_leaf: true,
            });
        }
        let free_byte_length = cursor.u32()?;
        let prev = cursor.offset(width)?;
        let next = cursor.offset(width)?;
        let prev_leaf = sibling(prev, prev_pointer_position(index), width)?;
        let next_leaf = sibling(next, next_pointer_position(index, width), width)?;
        let ext = if flags & RECORD_FLAG_HAS_EXT_DATA == 0 {
            None
        } else {
            Some(ExtRegion {
                length: cursor.u32()?,
                free_byte_length: cursor.u32()?,
            })
        };
        let ext_start = index + u64::from(byte_length);
        let count = cursor.u8()?;

        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let key = cursor.key()?;
            let values = if format.small_leafs {
                let header = cursor.u8()?;
                if header & SMALL_VALUE_EXT_FLAG == 0 {
                    let payload = cursor.take(usize::from(header))?;
                    LeafValues::Inline(decode_value_list(
                        payload,
                        format.unique,
                        format.metadata_count,
                    )?)
                } else {
                    let value_count = if format.unique { 1 } else { cursor.u32()? };
                    let relative = cursor.u32()?;
                    LeafValues::External(ExtPointer {
                        value_count,
                        block_index: ext_start + u64::from(relative),
                    })
                }
            } else {
                let length = cursor.u32()? as usize;
                let payload = cursor.take(length)?;
                LeafValues::Inline(decode_value_list(
                    payload,
                    format.unique,
                    format.metadata_count,
                )?)
            };
            entries.push(LeafRecordEntry { key, values });
        }

        let actual = cursor.position() + free_byte_length as usize;
        if actual != byte_length as usize {
            return Err(LayoutError::InvalidByteLength {
                expected: byte_length as usize,
                actual,
            });
        }

        Ok(Self {
            index,
            byte_length,
            free_byte_length,
            prev_leaf,
            next_leaf,
            ext,
            entries,
        })
    }
}

fn sibling(
    offset: RelativeOffset,
    field_position: u64,
    width: PointerWidth,
) -> Result<Option<u64>, LayoutError> {
    if offset == RelativeOffset::NONE {
        Ok(None)
    } else {
        offset.resolve(field_position, width).map(Some)
    }
}

const fn external_entry_len(unique: bool) -> usize {
    1 + if unique { 0 } else { VALUE_LIST_COUNT_SIZE } + 4
}

fn write_inline(
    out: &mut Vec<u8>,
    values: &[EntryValue],
    format: RecordFormat,
) -> Result<(), LayoutError> {
    let mut payload = Vec::new();
    encode_value_list(values, format.unique, &mut payload)?;
    if format.small_leafs {
        if values_len(values) > MAX_INLINE_VALUE_BYTES {
            return Err(LayoutError::NeedsExtData);
        }
        out.push(payload.len() as u8);
    } else {
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(&payload);
    Ok(())
}

/// Encodes an extension block holding `payload` with `capacity` data bytes.
#[must_use]
pub fn encode_ext_block(payload: &[u8], capacity: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(EXT_BLOCK_HEADER_LENGTH + capacity);
    out.extend_from_slice(&(capacity as u32).to_be_bytes());
    out.extend_from_slice(&((capacity - payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(EXT_BLOCK_HEADER_LENGTH + capacity, 0);
    out
}

/// Reads `(block_length, block_free)` from an extension block header.
pub fn decode_ext_block_header(bytes: &[u8]) -> Result<(u32, u32), LayoutError> {
    let mut cursor = Cursor::new(bytes);
    let length = cursor.u32()?;
    let free = cursor.u32()?;
    if free > length {
        return Err(LayoutError::InvalidByteLength {
            expected: length as usize,
            actual: free as usize,
        });
    }
    Ok((length, free))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RecordPointer;

    fn values(prefix: &str, n: usize) -> Vec<EntryValue> {
        (0..n)
            .map(|i| EntryValue::new(RecordPointer::from(format!("{prefix}/{i:04}").as_str())))
            .collect()
    }

    fn entries(keys: &[&str], per_key: usize) -> Vec<LeafEntry> {
        keys.iter()
            .map(|k| LeafEntry::new(Key::from(*k), values(k, per_key)))
            .collect()
    }

    #[test]
    fn test_inline_leaf_round_trip() {
        let format = RecordFormat::current(false, 0);
        let items = entries(&["a", "b", "c"], 2);
        let size = LeafRecord::measure(&items, format);
        assert_eq!(size.ext, 0);

        let mut leaf = LeafRecord::empty(1000, size.primary as u32 + 40, 0);
        leaf.prev_leaf = Some(200);
        leaf.next_leaf = Some(5000);
        let encoded = leaf.encode_full(&items, format).expect("encode");
        assert!(encoded.ext.is_none());
        assert_eq!(encoded.primary.len(), size.primary + 40);

        let decoded = LeafRecord::decode(&encoded.primary, 1000, format).expect("decode");
        assert_eq!(decoded.prev_leaf, Some(200));
        assert_eq!(decoded.next_leaf, Some(5000));
        assert_eq!(decoded.free_byte_length, 40);
        assert_eq!(decoded.loaded_entries().expect("loaded"), items);
    }

    #[test]
    fn test_large_value_list_goes_to_ext_region() {
        let format = RecordFormat::current(false, 0);
        // 20 values of 9 bytes each exceed the inline limit
        let items = vec![
            LeafEntry::new(Key::from("big"), values("big", 20)),
            LeafEntry::new(Key::from("small"), values("s", 1)),
        ];
        let size = LeafRecord::measure(&items, format);
        assert!(size.ext > 0);
        let (primary, ext) = size.allocation(items.len(), 10);

        let leaf = LeafRecord::empty(64, primary as u32, ext as u32);
        let encoded = leaf.encode_full(&items, format).expect("encode");
        let ext_bytes = encoded.ext.clone().expect("ext region");
        assert_eq!(ext_bytes.len(), ext);

        let decoded = LeafRecord::decode(&encoded.primary, 64, format).expect("decode");
        assert!(!decoded.is_loaded());
        let LeafValues::External(ptr) = decoded.entries[0].values else {
            panic!("expected external values");
        };
        assert_eq!(ptr.value_count, 20);

        let block_at = (ptr.block_index - decoded.ext_start()) as usize;
        let (length, free) =
            decode_ext_block_header(&ext_bytes[block_at..]).expect("block header");
        let data_start = block_at + EXT_BLOCK_HEADER_LENGTH;
        let data = &ext_bytes[data_start..data_start + (length - free) as usize];
        let loaded = decode_value_list(data, false, 0).expect("values");
        assert_eq!(loaded, items[0].values);
    }

    #[test]
    fn test_ext_data_without_region_fails() {
        let format = RecordFormat::current(true, 0);
        let big = EntryValue::new(RecordPointer::new(vec![7u8; 200]));
        let items = vec![LeafEntry::new(Key::from(1), vec![big])];
        let leaf = LeafRecord::empty(0, 400, 0);
        assert!(matches!(
            leaf.encode_full(&items, format),
            Err(LayoutError::ExtTooSmall { .. })
        ));
    }

    #[test]
    fn test_primary_encoding_keeps_ext_pointers() {
        let format = RecordFormat::current(false, 0);
        let items = entries(&["k"], 30);
        let size = LeafRecord::measure(&items, format);
        let (primary, ext) = size.allocation(1, 4);
        let leaf = LeafRecord::empty(10, primary as u32, ext as u32);
        let encoded = leaf.encode_full(&items, format).expect("encode");
        let mut decoded = LeafRecord::decode(&encoded.primary, 10, format).expect("decode");

        decoded
            .entries
            .push(LeafRecordEntry::from(LeafEntry::new(Key::from("z"), values("z", 1))));
        let primary = decoded.encode_primary(format).expect("primary");
        let again = LeafRecord::decode(&primary, 10, format).expect("decode");
        assert_eq!(again.entries, decoded.entries);
        assert_eq!(again.ext, decoded.ext);
    }

    #[test]
    fn test_primary_encoding_rejects_oversized_inline() {
        let format = RecordFormat::current(false, 0);
        let mut leaf = LeafRecord::empty(0, 4096, 0);
        leaf.entries
            .push(LeafRecordEntry::from(LeafEntry::new(Key::from("k"), values("k", 30))));
        assert_eq!(leaf.encode_primary(format), Err(LayoutError::NeedsExtData));
    }

    #[test]
    fn test_leaf_too_small() {
        let format = RecordFormat::current(true, 0);
        let items = entries(&["a", "b"], 1);
        let leaf = LeafRecord::empty(0, 20, 0);
        assert!(matches!(
            leaf.encode_full(&items, format),
            Err(LayoutError::LeafTooSmall { .. })
        ));
    }

    #[test]
    fn test_non_small_leaf_format() {
        let format = RecordFormat {
            width: PointerWidth::Legacy,
            unique: true,
            small_leafs: false,
            metadata_count: 0,
        };
        let big = EntryValue::new(RecordPointer::new(vec![1u8; 200]));
        let items = vec![LeafEntry::new(Key::from(1), vec![big])];
        let leaf = LeafRecord::empty(6, 512, 0);
        let encoded = leaf.encode_full(&items, format).expect("encode");
        let decoded = LeafRecord::decode(&encoded.primary, 6, format).expect("decode");
        assert_eq!(decoded.loaded_entries().expect("inline"), items);
    }
}
