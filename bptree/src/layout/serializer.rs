//! Depth-first serialization of an in-memory tree.
//!
//! Records are written in pre-order: a node, then each of its children left to
//! right. Child and sibling positions are unknown when a record is first
//! written, so every record is written with placeholder pointers, its position
//! is remembered, and all pointers are patched once the whole tree is laid out.
//! Re-encoding a record with real pointers never changes its length.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;

use super::leaf::LeafRecord;
use super::node::{NodeEntry, NodeRecord};
use super::{LayoutError, RecordFormat, TreeHeader, growth_bytes, min_root_length};
use crate::entry::LeafEntry;
use crate::memory::{MemoryNode, MemoryTree, NodeId};

struct PendingLeaf {
    id: NodeId,
    record: LeafRecord,
    entries: Vec<LeafEntry>,
}

struct DepthFirstWriter<'a> {
    tree: &'a MemoryTree,
    format: RecordFormat,
    capacity: usize,
    out: Vec<u8>,
    positions: HashMap<NodeId, u64>,
    nodes: Vec<(NodeId, NodeRecord)>,
    leaves: Vec<PendingLeaf>,
}

impl DepthFirstWriter<'_> {
    fn write(&mut self, id: NodeId) -> Result<(), LayoutError> {
        let index = self.out.len() as u64;
        self.positions.insert(id, index);
        let is_root = id == self.tree.root();

        match self.tree.node(id) {
            MemoryNode::Leaf(leaf) => {
                let size = LeafRecord::measure(&leaf.entries, self.format);
                let (mut primary, ext) = size.allocation(leaf.entries.len(), self.capacity);
                if is_root {
                    primary = primary.max(min_root_length(self.format.width));
                }
                let record = LeafRecord::empty(index, primary as u32, ext as u32);
                let encoded = record.encode_full(&leaf.entries, self.format)?;
                self.out.extend(encoded.into_bytes());
                self.leaves.push(PendingLeaf {
                    id,
                    record,
                    entries: leaf.entries.clone(),
                });
            }
            MemoryNode::Internal(node) => {
                let mut record = NodeRecord {
                    index,
                    byte_length: 0,
                    free_byte_length: 0,
                    entries: node
                        .entries
                        .iter()
                        .map(|(key, _)| NodeEntry {
                            key: key.clone(),
                            lt_child: index,
                        })
                        .collect(),
                    gt_child: index,
                };
                let content = record.content_length(self.format.width);
                let entries_len = content - super::node::NODE_HEADER_LENGTH;
                let mut length =
                    content + growth_bytes(entries_len, node.entries.len(), self.capacity);
                if is_root {
                    length = length.max(min_root_length(self.format.width));
                }
                record.byte_length = length as u32;
                self.out.extend(record.encode(self.format.width)?);
                self.nodes.push((id, record));
                for child in node.children() {
                    self.write(child)?;
                }
            }
        }
        Ok(())
    }

    fn position(&self, id: NodeId) -> Result<u64, LayoutError> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(LayoutError::OffsetOutOfRange { offset: -1 })
    }

    fn patch(&mut self, index: u64, bytes: &[u8]) {
        let start = index as usize;
        self.out[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn patch_pointers(&mut self) -> Result<(), LayoutError> {
        let nodes = std::mem::take(&mut self.nodes);
        for (id, mut record) in nodes {
            let MemoryNode::Internal(node) = self.tree.node(id) else {
                continue;
            };
            for (slot, child) in node.children().into_iter().enumerate() {
                record.set_child(slot, self.position(child)?);
            }
            let bytes = record.encode(self.format.width)?;
            self.patch(record.index, &bytes);
        }

        let leaves = std::mem::take(&mut self.leaves);
        for mut pending in leaves {
            let Some(leaf) = self.tree.leaf(pending.id) else {
                continue;
            };
            pending.record.prev_leaf = leaf.prev.map(|p| self.position(p)).transpose()?;
            pending.record.next_leaf = leaf.next.map(|n| self.position(n)).transpose()?;
            let bytes = pending
                .record
                .encode_full(&pending.entries, self.format)?
                .into_bytes();
            self.patch(pending.record.index, &bytes);
        }
        Ok(())
    }
}

/// Serializes `tree` into a complete binary tree image.
pub fn serialize(tree: &MemoryTree) -> Result<Vec<u8>, LayoutError> {
    let options = tree.options();
    let mut header = TreeHeader::new(
        options.unique,
        options.max_entries_per_node,
        options.fill_factor,
        options.metadata_keys.clone(),
    );
    let mut writer = DepthFirstWriter {
        tree,
        format: header.format(),
        capacity: usize::from(options.max_entries_per_node),
        out: header.encode()?,
        positions: HashMap::new(),
        nodes: Vec::new(),
        leaves: Vec::new(),
    };
    writer.write(tree.root())?;
    writer.patch_pointers()?;

    let mut out = writer.out;
    let used = out.len();
    let free = used * usize::from(options.free_space_percent) / 100;
    out.resize(used + free, 0);

    header.byte_length = u32::try_from(out.len()).map_err(|_| LayoutError::InvalidByteLength {
        expected: u32::MAX as usize,
        actual: out.len(),
    })?;
    header.free_byte_length = free as u32;
    let header_bytes = header.encode()?;
    out[..header_bytes.len()].copy_from_slice(&header_bytes);
    Ok(out)
}
