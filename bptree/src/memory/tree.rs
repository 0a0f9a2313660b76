//! In-memory B+Tree.
//!
//! Used as a scratch structure for incremental building; once complete it is
//! serialized into the binary layout with [`MemoryTree::to_binary`].
//!
//! # Design
//!
//! Nodes live in an arena (`Vec<MemoryNode>`) and reference each other by
//! [`NodeId`]. Nodes are never removed, so ids stay valid for the tree's
//! lifetime. Splits follow the classic scheme: the upper half of an
//! overflowing leaf moves to a new right sibling, its first key is copied into
//! the parent, and parent overflow propagates upward, growing a new root when
//! the old root splits.

use super::node::{InternalNode, LeafNode, MemoryNode, NodeId};
use crate::config::TreeOptions;
use crate::entry::{EntryValue, LeafEntry};
use crate::error::TreeError;
use crate::key::Key;
use crate::layout::{LayoutError, serializer};

/// A mutable, arena-backed B+Tree.
#[derive(Debug, Clone)]
pub struct MemoryTree {
    nodes: Vec<MemoryNode>,
    root: NodeId,
    options: TreeOptions,
}

impl MemoryTree {
    /// Creates an empty tree whose root is a single empty leaf.
    pub fn new(options: TreeOptions) -> Result<Self, TreeError> {
        options.validate()?;
        Ok(Self {
            nodes: vec![MemoryNode::Leaf(LeafNode::default())],
            root: NodeId(0),
            options,
        })
    }

    /// Builds a tree from entries in any order.
    pub fn from_entries(
        options: TreeOptions,
        entries: impl IntoIterator<Item = (Key, EntryValue)>,
    ) -> Result<Self, TreeError> {
        let mut tree = Self::new(options)?;
        for (key, value) in entries {
            tree.add(key, value)?;
        }
        Ok(tree)
    }

    #[must_use]
    pub const fn options(&self) -> &TreeOptions {
        &self.options
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &MemoryNode {
        &self.nodes[id.0]
    }

    /// Returns the leaf with `id`, if it is one.
    #[must_use]
    pub fn leaf(&self, id: NodeId) -> Option<&LeafNode> {
        match &self.nodes[id.0] {
            MemoryNode::Leaf(leaf) => Some(leaf),
            MemoryNode::Internal(_) => None,
        }
    }

    fn leaf_mut(&mut self, id: NodeId) -> Result<&mut LeafNode, TreeError> {
        match &mut self.nodes[id.0] {
            MemoryNode::Leaf(leaf) => Ok(leaf),
            MemoryNode::Internal(_) => Err(misplaced(id, "a leaf")),
        }
    }

    fn internal_mut(&mut self, id: NodeId) -> Result<&mut InternalNode, TreeError> {
        match &mut self.nodes[id.0] {
            MemoryNode::Internal(node) => Ok(node),
            MemoryNode::Leaf(_) => Err(misplaced(id, "an internal node")),
        }
    }

    fn push(&mut self, node: MemoryNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Descends to the leaf whose key range contains `key`.
    #[must_use]
    pub fn find_leaf(&self, key: &Key) -> NodeId {
        let mut current = self.root;
        while let MemoryNode::Internal(node) = &self.nodes[current.0] {
            current = node.child(node.child_slot_for(key));
        }
        current
    }

    /// Values stored under `key`, if present.
    #[must_use]
    pub fn find(&self, key: &Key) -> Option<&[EntryValue]> {
        let leaf = self.leaf(self.find_leaf(key))?;
        leaf.search(key).ok().map(|i| leaf.entries[i].values.as_slice())
    }

    /// Leftmost leaf.
    #[must_use]
    pub fn first_leaf(&self) -> NodeId {
        let mut current = self.root;
        while let MemoryNode::Internal(node) = &self.nodes[current.0] {
            current = node.child(0);
        }
        current
    }

    /// Rightmost leaf.
    #[must_use]
    pub fn last_leaf(&self) -> NodeId {
        let mut current = self.root;
        while let MemoryNode::Internal(node) = &self.nodes[current.0] {
            current = node.gt_child;
        }
        current
    }

    /// All entries in key order, following the leaf chain.
    pub fn entries(&self) -> impl Iterator<Item = &LeafEntry> {
        let mut next = Some(self.first_leaf());
        std::iter::from_fn(move || {
            let id = next?;
            let leaf = self.leaf(id)?;
            next = leaf.next;
            Some(leaf.entries.iter())
        })
        .flatten()
    }

    /// Number of keys in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Adds `value` under `key`.
    ///
    /// Unique trees reject an existing key; non-unique trees append to its
    /// value list, rejecting a record pointer that is already present.
    pub fn add(&mut self, key: Key, value: EntryValue) -> Result<(), TreeError> {
        key.to_bytes()?;
        value.validate(self.options.metadata_keys.len())?;

        let unique = self.options.unique;
        let max = usize::from(self.options.max_entries_per_node);
        let leaf_id = self.find_leaf(&key);
        let leaf = self.leaf_mut(leaf_id)?;
        match leaf.search(&key) {
            Ok(i) => {
                if unique {
                    return Err(TreeError::DuplicateKey(key));
                }
                let values = &mut leaf.entries[i].values;
                if values
                    .iter()
                    .any(|v| v.record_pointer == value.record_pointer)
                {
                    return Err(TreeError::DuplicateValue {
                        key,
                        record_pointer: value.record_pointer,
                    });
                }
                values.push(value);
                return Ok(());
            }
            Err(i) => leaf.entries.insert(i, LeafEntry::new(key, vec![value])),
        }

        if leaf.entries.len() > max {
            self.split_leaf(leaf_id)?;
        }
        Ok(())
    }

    fn split_leaf(&mut self, leaf_id: NodeId) -> Result<(), TreeError> {
        let leaf = self.leaf_mut(leaf_id)?;
        let mid = leaf.entries.len() / 2;
        let upper = leaf.entries.split_off(mid);
        let separator = upper[0].key.clone();
        let parent = leaf.parent;
        let old_next = leaf.next;

        let new_id = self.push(MemoryNode::Leaf(LeafNode {
            parent,
            prev: Some(leaf_id),
            next: old_next,
            entries: upper,
        }));
        self.leaf_mut(leaf_id)?.next = Some(new_id);
        if let Some(next) = old_next {
            self.leaf_mut(next)?.prev = Some(new_id);
        }
        self.insert_into_parent(leaf_id, separator, new_id)
    }

    /// Links `right` as the new sibling after `left`, separated by `separator`.
    fn insert_into_parent(
        &mut self,
        left: NodeId,
        separator: Key,
        right: NodeId,
    ) -> Result<(), TreeError> {
        let Some(parent_id) = self.nodes[left.0].parent() else {
            let root = self.push(MemoryNode::Internal(InternalNode {
                parent: None,
                entries: vec![(separator, left)],
                gt_child: right,
            }));
            self.nodes[left.0].set_parent(Some(root));
            self.nodes[right.0].set_parent(Some(root));
            self.root = root;
            return Ok(());
        };

        let max = usize::from(self.options.max_entries_per_node);
        let parent = self.internal_mut(parent_id)?;
        let slot = parent.slot_of(left).unwrap_or(parent.entries.len());
        if slot < parent.entries.len() {
            parent.entries.insert(slot, (separator, left));
            parent.entries[slot + 1].1 = right;
        } else {
            parent.entries.push((separator, left));
            parent.gt_child = right;
        }
        let overflow = parent.entries.len() > max;
        self.nodes[right.0].set_parent(Some(parent_id));

        if overflow {
            self.split_internal(parent_id)?;
        }
        Ok(())
    }

    fn split_internal(&mut self, node_id: NodeId) -> Result<(), TreeError> {
        let node = self.internal_mut(node_id)?;
        let mid = node.entries.len() / 2;
        let mut upper = node.entries.split_off(mid);
        let (separator, middle_child) = upper.remove(0);
        let right_gt = node.gt_child;
        node.gt_child = middle_child;
        let parent = node.parent;

        let right = self.push(MemoryNode::Internal(InternalNode {
            parent,
            entries: upper,
            gt_child: right_gt,
        }));
        let moved = match &self.nodes[right.0] {
            MemoryNode::Internal(node) => node.children(),
            MemoryNode::Leaf(_) => Vec::new(),
        };
        for child in moved {
            self.nodes[child.0].set_parent(Some(right));
        }
        self.insert_into_parent(node_id, separator, right)
    }

    /// Serializes the tree into the binary layout.
    pub fn to_binary(&self) -> Result<Vec<u8>, LayoutError> {
        serializer::serialize(self)
    }
}

fn misplaced(id: NodeId, expected: &str) -> TreeError {
    TreeError::InvalidArgument(format!("node {} is not {expected}", id.0))
}
