//! Internal node records.
//!
//! ```text
//! [byte_length: u32][flags: u8 = 0][free_byte_length: u32][entry_count: u8]
//! ([key][lt_child: ptr])*
//! [gt_child: ptr]
//! [free bytes]
//! ```
//!
//! # Invariants
//!
//! - Entries are sorted ascending. Only the root may hold none, pointing at
//!   its single child through the greater-than pointer.
//! - Every key reachable through an entry's `lt_child` is less than the entry's
//!   key; every key reachable through the next child is greater or equal.

#![allow(clippy::cast_possible_truncation)]

use super::{Cursor, LayoutError, PointerWidth, RECORD_FLAG_IS_LEAF, RelativeOffset};
use crate::key::Key;

/// Bytes before the first node entry.
pub const NODE_HEADER_LENGTH: usize = 10;

/// A separator key and the child holding the keys below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub key: Key,
    pub lt_child: u64,
}

/// Decoded internal node. Child positions are absolute within the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub index: u64,
    pub byte_length: u32,
    pub free_byte_length: u32,
    pub entries: Vec<NodeEntry>,
    pub gt_child: u64,
}

impl NodeRecord {
    /// Child at `slot`; slot `entries.len()` is the greater-than child.
    #[must_use]
    pub fn child(&self, slot: usize) -> u64 {
        self.entries.get(slot).map_or(self.gt_child, |e| e.lt_child)
    }

    pub fn set_child(&mut self, slot: usize, target: u64) {
        match self.entries.get_mut(slot) {
            Some(entry) => entry.lt_child = target,
            None => self.gt_child = target,
        }
    }

    /// Slot of the child whose range contains `key`: the first entry with a
    /// greater key, or the greater-than child.
    #[must_use]
    pub fn child_slot_for(&self, key: &Key) -> usize {
        self.entries.partition_point(|e| e.key <= *key)
    }

    /// Slot holding `child`, if any.
    #[must_use]
    pub fn slot_of(&self, child: u64) -> Option<usize> {
        (0..=self.entries.len()).find(|slot| self.child(*slot) == child)
    }

    /// Inserts separator `key` after splitting the child at `slot` into `left`
    /// and `right`.
    pub fn insert_separator(&mut self, slot: usize, key: Key, left: u64, right: u64) {
        if slot < self.entries.len() {
            self.entries.insert(slot, NodeEntry { key, lt_child: left });
            self.entries[slot + 1].lt_child = right;
        } else {
            self.entries.push(NodeEntry { key, lt_child: left });
            self.gt_child = right;
        }
    }

    /// Removes the child at `slot` together with one adjacent separator.
    ///
    /// Returns false when the node would be left without entries.
    pub fn remove_child(&mut self, slot: usize) -> bool {
        if self.entries.len() < 2 {
            return false;
        }
        if slot < self.entries.len() {
            self.entries.remove(slot);
        } else if let Some(last) = self.entries.pop() {
            self.gt_child = last.lt_child;
        }
        true
    }

    /// Bytes needed for the header, entries and greater-than pointer.
    #[must_use]
    pub fn content_length(&self, width: PointerWidth) -> usize {
        NODE_HEADER_LENGTH
            + self
                .entries
                .iter()
                .map(|e| e.key.encoded_len() + width.bytes())
                .sum::<usize>()
            + width.bytes()
    }

    /// Encodes the node into exactly `byte_length` bytes.
    pub fn encode(&self, width: PointerWidth) -> Result<Vec<u8>, LayoutError> {
        let count = self.entries.len();
        if count > usize::from(u8::MAX) {
            return Err(LayoutError::TooManyEntries { count });
        }
        let content = self.content_length(width);
        let total = self.byte_length as usize;
        if content > total {
            return Err(LayoutError::NodeTooSmall {
                needed: content,
                available: total,
            });
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.byte_length.to_be_bytes());
        out.push(0);
        out.extend_from_slice(&((total - content) as u32).to_be_bytes());
        out.push(count as u8);
        for entry in &self.entries {
            entry.key.encode_into(&mut out)?;
            let field = self.index + out.len() as u64;
            RelativeOffset::between(field, entry.lt_child, width)?.write(width, &mut out);
        }
        let field = self.index + out.len() as u64;
        RelativeOffset::between(field, self.gt_child, width)?.write(width, &mut out);
        out.resize(total, 0);
        Ok(out)
    }

    /// Decodes a node stored at `index` from its full record bytes.
    pub fn decode(bytes: &[u8], index: u64, width: PointerWidth) -> Result<Self, LayoutError> {
        let mut cursor = Cursor::new(bytes);
        let byte_length = cursor.u32()?;
        let flags = cursor.u8()?;
        if flags & RECORD_FLAG_IS_LEAF != 0 {
            return Err(LayoutError::UnexpectedRecord {
                index,
                expected_leaf: false,
            });
        }
        let free_byte_length = cursor.u32()?;
        let count = cursor.u8()?;

        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let key = cursor.key()?;
            let field = index + cursor.position() as u64;
            let lt_child = cursor.offset(width)?.resolve(field, width)?;
            entries.push(NodeEntry { key, lt_child });
        }
        let field = index + cursor.position() as u64;
        let gt_child = cursor.offset(width)?.resolve(field, width)?;

        if cursor.position() + free_byte_length as usize != byte_length as usize {
            return Err(LayoutError::InvalidByteLength {
                expected: byte_length as usize,
                actual: cursor.position() + free_byte_length as usize,
            });
        }

        Ok(Self {
            index,
            byte_length,
            free_byte_length,
            entries,
            gt_child,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(keys: &[i32], index: u64) -> NodeRecord {
        NodeRecord {
            index,
            byte_length: 200,
            free_byte_length: 0,
            entries: keys
                .iter()
                .enumerate()
                .map(|(i, k)| NodeEntry {
                    key: Key::from(*k),
                    lt_child: 1000 + i as u64 * 100,
                })
                .collect(),
            gt_child: 5,
        }
    }

    #[test]
    fn test_node_encode_decode_both_widths() {
        for width in [PointerWidth::Large, PointerWidth::Legacy] {
            let original = node(&[10, 20, 30], 300);
            let bytes = original.encode(width).expect("encode");
            assert_eq!(bytes.len(), 200);
            let decoded = NodeRecord::decode(&bytes, 300, width).expect("decode");
            assert_eq!(decoded.entries, original.entries);
            assert_eq!(decoded.gt_child, 5);
            assert_eq!(
                decoded.free_byte_length as usize,
                200 - original.content_length(width)
            );
        }
    }

    #[test]
    fn test_node_too_small() {
        let mut n = node(&[1, 2, 3], 0);
        n.byte_length = 20;
        assert!(matches!(
            n.encode(PointerWidth::Large),
            Err(LayoutError::NodeTooSmall { .. })
        ));
    }

    #[test]
    fn test_child_slot_for() {
        let n = node(&[10, 20], 0);
        assert_eq!(n.child_slot_for(&Key::from(5)), 0);
        assert_eq!(n.child_slot_for(&Key::from(10)), 1);
        assert_eq!(n.child_slot_for(&Key::from(25)), 2);
        assert_eq!(n.child(2), 5);
    }

    #[test]
    fn test_redirect_root_routes_everything_to_gt_child() {
        let mut n = node(&[], 0);
        n.gt_child = 4242;
        let bytes = n.encode(PointerWidth::Large).expect("encode");
        let decoded = NodeRecord::decode(&bytes, 0, PointerWidth::Large).expect("decode");
        assert!(decoded.entries.is_empty());
        assert_eq!(decoded.child_slot_for(&Key::from(-1)), 0);
        assert_eq!(decoded.child(decoded.child_slot_for(&Key::from(99))), 4242);
    }

    #[test]
    fn test_insert_separator_and_remove_child() {
        let mut n = node(&[10, 20], 0);
        // split child at slot 1 (range 10..20) into 1100 and 7777
        n.insert_separator(1, Key::from(15), 1100, 7777);
        let keys: Vec<_> = n.entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![Key::from(10), Key::from(15), Key::from(20)]);
        assert_eq!(n.child(1), 1100);
        assert_eq!(n.child(2), 7777);

        // split the greater-than child
        n.insert_separator(3, Key::from(40), 5, 9999);
        assert_eq!(n.child(3), 5);
        assert_eq!(n.gt_child, 9999);

        assert!(n.remove_child(4));
        assert_eq!(n.gt_child, 5);
        assert!(n.remove_child(0));
        assert_eq!(n.entries.len(), 2);
        assert_eq!(n.child(0), 1100);
    }

    #[test]
    fn test_leaf_record_rejected() {
        let mut bytes = node(&[1], 0).encode(PointerWidth::Large).expect("encode");
        bytes[4] = RECORD_FLAG_IS_LEAF;
        assert!(matches!(
            NodeRecord::decode(&bytes, 0, PointerWidth::Large),
            Err(LayoutError::UnexpectedRecord { .. })
        ));
    }
}
