//! Arena nodes of the in-memory tree.
//!
//! Nodes refer to each other through [`NodeId`] indices into the owning
//! tree's arena, so parent and sibling links need no shared ownership.

use crate::entry::LeafEntry;
use crate::key::Key;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Internal node: separator keys with their less-than children.
#[derive(Debug, Clone)]
pub struct InternalNode {
    pub parent: Option<NodeId>,
    pub entries: Vec<(Key, NodeId)>,
    pub gt_child: NodeId,
}

impl InternalNode {
    /// Child at `slot`; slot `entries.len()` is the greater-than child.
    #[must_use]
    pub fn child(&self, slot: usize) -> NodeId {
        self.entries.get(slot).map_or(self.gt_child, |(_, child)| *child)
    }

    /// All children in key order.
    #[must_use]
    pub fn children(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .map(|(_, child)| *child)
            .chain(std::iter::once(self.gt_child))
            .collect()
    }

    /// Slot of the child whose range contains `key`.
    #[must_use]
    pub fn child_slot_for(&self, key: &Key) -> usize {
        self.entries.partition_point(|(k, _)| k <= key)
    }

    #[must_use]
    pub fn slot_of(&self, child: NodeId) -> Option<usize> {
        (0..=self.entries.len()).find(|slot| self.child(*slot) == child)
    }
}

/// Leaf: sorted entries plus links to its neighbours.
#[derive(Debug, Clone, Default)]
pub struct LeafNode {
    pub parent: Option<NodeId>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    pub fn search(&self, key: &Key) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }
}

#[derive(Debug, Clone)]
pub enum MemoryNode {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl MemoryNode {
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        match self {
            Self::Internal(node) => node.parent,
            Self::Leaf(leaf) => leaf.parent,
        }
    }

    pub const fn set_parent(&mut self, parent: Option<NodeId>) {
        match self {
            Self::Internal(node) => node.parent = parent,
            Self::Leaf(leaf) => leaf.parent = parent,
        }
    }
}
