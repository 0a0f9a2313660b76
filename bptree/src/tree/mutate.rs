//! Mutation engine: add, remove and update against a serialized tree.
//!
//! Each mutation reads the records it touches through a [`Navigator`], stages
//! every changed byte range in a [`WriteBatch`] and commits the batch
//! atomically. Structural work that cannot finish in one batch (splitting a
//! full ancestor before its child can split) commits as its own round, after
//! which the mutation starts over against the updated tree.
//!
//! # Design
//!
//! A leaf is rewritten in the cheapest way that fits:
//!
//! 1. Its primary region alone, when no value list outgrew the inline limit
//! 2. Primary region and extension region in place
//! 3. A fresh allocation, relinking neighbours and the parent pointer
//!
//! Space comes from the free-space table first, then the tree's trailing free
//! region, then by growing the tree when auto-grow is enabled.
//!
//! # Invariants
//!
//! - Released ranges only become reusable after the batch that released them commits
//! - The root record never moves. A root that outgrows itself splits in
//!   place, or hands its separators to a new child when too few to split
//! - A failed commit leaves storage, header and free-space table unchanged

#![allow(clippy::cast_possible_truncation)]

use super::commit::WriteBatch;
use super::free_space::FreeSpaceTable;
use super::navigator::{Navigator, PathStep};
use crate::config::EngineConfig;
use crate::entry::{EntryValue, LeafEntry, RecordPointer, encode_value_list, values_len};
use crate::error::TreeError;
use crate::key::Key;
use crate::layout::leaf::{
    EXT_BLOCK_HEADER_LENGTH, encode_ext_block, next_pointer_position, prev_pointer_position,
};
use crate::layout::node::NODE_HEADER_LENGTH;
use crate::layout::{
    ExtPointer, LayoutError, LeafRecord, LeafRecordEntry, LeafValues, MAX_INLINE_VALUE_BYTES,
    NodeEntry, NodeRecord, RecordFormat, TreeHeader, encode_pointer, ext_block_growth,
    growth_bytes,
};
use crate::storage::ByteStorage;

/// Restructuring rounds a single mutation may take before giving up.
const MAX_ROUNDS: usize = 64;

/// A single change applied by [`Editor::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeOperation {
    Add {
        key: Key,
        value: EntryValue,
    },
    Remove {
        key: Key,
        record_pointer: RecordPointer,
    },
    Update {
        key: Key,
        value: EntryValue,
        current: RecordPointer,
    },
}

impl TreeOperation {
    #[must_use]
    pub const fn add(key: Key, value: EntryValue) -> Self {
        Self::Add { key, value }
    }

    #[must_use]
    pub const fn remove(key: Key, record_pointer: RecordPointer) -> Self {
        Self::Remove {
            key,
            record_pointer,
        }
    }

    #[must_use]
    pub const fn update(key: Key, value: EntryValue, current: RecordPointer) -> Self {
        Self::Update {
            key,
            value,
            current,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &Key {
        match self {
            Self::Add { key, .. } | Self::Remove { key, .. } | Self::Update { key, .. } => key,
        }
    }
}

/// Whether a round finished the mutation or only restructured the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Restructured,
    /// The entry is gone but its leaf stayed linked, empty, because its
    /// parent has no other separator.
    LeftEmptyLeaf,
}

/// Applies mutations to one tree while its exclusive lock is held.
pub struct Editor<'t, S> {
    storage: &'t S,
    nav: Navigator<'t, S>,
    config: &'t EngineConfig,
    /// Free ranges as of the last successful commit.
    committed_free: FreeSpaceTable,
    free: FreeSpaceTable,
    header: TreeHeader,
    batch: WriteBatch,
    released: Vec<(u64, u64)>,
    kept_empty_leaf: bool,
}

impl<'t, S: ByteStorage> Editor<'t, S> {
    /// Opens an editor, refusing trees written with legacy pointers.
    pub async fn open(
        storage: &'t S,
        config: &'t EngineConfig,
        free: FreeSpaceTable,
    ) -> Result<Self, TreeError> {
        let nav = Navigator::open(storage, config.read_chunk_size).await?;
        let header = nav.header().clone();
        if !header.large_ptrs {
            return Err(TreeError::ReadOnlyLegacyFormat);
        }
        Ok(Self {
            storage,
            nav,
            config,
            free: free.clone(),
            committed_free: free,
            header,
            batch: WriteBatch::new(),
            released: Vec::new(),
            kept_empty_leaf: false,
        })
    }

    /// Free-space table after the last commit.
    #[must_use]
    pub const fn free_space(&self) -> &FreeSpaceTable {
        &self.committed_free
    }

    /// Consumes the editor, returning the committed free-space table and
    /// whether a committed removal left an empty leaf behind.
    #[must_use]
    pub fn finish(self) -> (FreeSpaceTable, bool) {
        (self.committed_free, self.kept_empty_leaf)
    }

    /// Applies one operation, committing every round it needs.
    ///
    /// A removal that empties a leaf which cannot be unlinked commits the
    /// removal and then fails with [`TreeError::LeafEmpty`]; the tree needs a
    /// rebuild before that leaf can go.
    pub async fn apply(&mut self, operation: &TreeOperation) -> Result<(), TreeError> {
        self.validate(operation)?;
        for _ in 0..MAX_ROUNDS {
            self.begin();
            let outcome = match self.attempt(operation).await {
                Ok(outcome) => outcome,
                Err(TreeError::Layout(e @ LayoutError::NodeTooSmall { .. })) => {
                    // Only the root cannot be relocated when it runs out of room.
                    self.begin();
                    let root = self.nav.read_node(self.header.root_index()).await?;
                    match root.entries.len() {
                        0 => return Err(e.into()),
                        1 | 2 => self.push_down_root(root)?,
                        _ => self.split_node(&[], root).await?,
                    }
                    Outcome::Restructured
                }
                Err(e) => return Err(e),
            };
            self.commit().await?;
            match outcome {
                Outcome::Done => return Ok(()),
                Outcome::LeftEmptyLeaf => {
                    self.kept_empty_leaf = true;
                    return Err(TreeError::LeafEmpty);
                }
                Outcome::Restructured => {}
            }
        }
        Err(TreeError::InvalidArgument(format!(
            "mutation of key {} did not settle after {MAX_ROUNDS} rounds",
            operation.key()
        )))
    }

    fn validate(&self, operation: &TreeOperation) -> Result<(), TreeError> {
        operation.key().to_bytes()?;
        match operation {
            TreeOperation::Add { value, .. } | TreeOperation::Update { value, .. } => {
                value.validate(self.header.metadata_keys.len())?;
            }
            TreeOperation::Remove { .. } => {}
        }
        Ok(())
    }

    async fn attempt(&mut self, operation: &TreeOperation) -> Result<Outcome, TreeError> {
        match operation {
            TreeOperation::Add { key, value } => self.attempt_add(key, value).await,
            TreeOperation::Remove {
                key,
                record_pointer,
            } => self.attempt_remove(key, record_pointer).await,
            TreeOperation::Update {
                key,
                value,
                current,
            } => self.attempt_update(key, value, current).await,
        }
    }

    fn capacity(&self) -> usize {
        usize::from(self.header.max_entries_per_node)
    }

    fn format(&self) -> RecordFormat {
        self.header.format()
    }

    /// Resets the staged state to the last commit.
    fn begin(&mut self) {
        self.free.clone_from(&self.committed_free);
        self.header = self.nav.header().clone();
        self.batch = WriteBatch::new();
        self.released.clear();
    }

    async fn commit(&mut self) -> Result<(), TreeError> {
        let mut batch = std::mem::take(&mut self.batch);
        batch.write(0, self.header.encode()?);
        batch.commit(self.storage).await?;

        let mut free = std::mem::take(&mut self.free);
        for (offset, length) in self.released.drain(..) {
            free.release(offset, length);
        }
        self.committed_free = free;
        self.nav.refresh().await
    }

    async fn attempt_add(&mut self, key: &Key, value: &EntryValue) -> Result<Outcome, TreeError> {
        let (path, mut leaf) = self.nav.find_leaf_path(key).await?;
        match leaf.search(key) {
            Ok(index) => {
                if self.header.unique {
                    return Err(TreeError::UniqueKeyViolation(key.clone()));
                }
                let mut values = self.nav.entry_values(&leaf.entries[index]).await?;
                if values
                    .iter()
                    .any(|v| v.record_pointer == value.record_pointer)
                {
                    return Err(TreeError::DuplicateValue {
                        key: key.clone(),
                        record_pointer: value.record_pointer.clone(),
                    });
                }
                values.push(value.clone());
                self.store_values(&path, leaf, index, values).await?;
                Ok(Outcome::Done)
            }
            Err(position) => {
                leaf.entries.insert(position, LeafRecordEntry {
                    key: key.clone(),
                    values: LeafValues::Inline(vec![value.clone()]),
                });
                if leaf.entries.len() <= self.capacity() {
                    self.write_leaf(&path, leaf).await?;
                    return Ok(Outcome::Done);
                }
                if let Some(depth) = topmost_full(&path, self.capacity()) {
                    let node = path[depth].node.clone();
                    self.split_node(&path[..depth], node).await?;
                    return Ok(Outcome::Restructured);
                }
                self.split_leaf(&path, leaf).await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn attempt_remove(
        &mut self,
        key: &Key,
        record_pointer: &RecordPointer,
    ) -> Result<Outcome, TreeError> {
        let (path, mut leaf) = self.nav.find_leaf_path(key).await?;
        let index = leaf
            .search(key)
            .map_err(|_| TreeError::KeyNotFound(key.clone()))?;
        let mut values = self.nav.entry_values(&leaf.entries[index]).await?;
        let position = values
            .iter()
            .position(|v| &v.record_pointer == record_pointer)
            .ok_or_else(|| TreeError::ValueNotFound {
                key: key.clone(),
                record_pointer: record_pointer.clone(),
            })?;
        values.remove(position);
        if !values.is_empty() {
            self.store_values(&path, leaf, index, values).await?;
            return Ok(Outcome::Done);
        }

        leaf.entries.remove(index);
        let mut outcome = Outcome::Done;
        if leaf.entries.is_empty() && !path.is_empty() {
            match self.remove_leaf(&path, &leaf) {
                Ok(()) => return Ok(Outcome::Done),
                Err(TreeError::LeafEmpty) => {
                    tracing::warn!(
                        "leaf at {} is empty but its parent has a single entry, rebuild required",
                        leaf.index
                    );
                    outcome = Outcome::LeftEmptyLeaf;
                }
                Err(e) => return Err(e),
            }
        }
        self.write_leaf(&path, leaf).await?;
        Ok(outcome)
    }

    async fn attempt_update(
        &mut self,
        key: &Key,
        value: &EntryValue,
        current: &RecordPointer,
    ) -> Result<Outcome, TreeError> {
        let (path, leaf) = self.nav.find_leaf_path(key).await?;
        let index = leaf
            .search(key)
            .map_err(|_| TreeError::KeyNotFound(key.clone()))?;
        let mut values = self.nav.entry_values(&leaf.entries[index]).await?;
        let position = values
            .iter()
            .position(|v| &v.record_pointer == current)
            .ok_or_else(|| TreeError::ValueNotFound {
                key: key.clone(),
                record_pointer: current.clone(),
            })?;
        if value.record_pointer != *current
            && values
                .iter()
                .any(|v| v.record_pointer == value.record_pointer)
        {
            return Err(TreeError::DuplicateValue {
                key: key.clone(),
                record_pointer: value.record_pointer.clone(),
            });
        }
        values[position] = value.clone();
        self.store_values(&path, leaf, index, values).await?;
        Ok(Outcome::Done)
    }

    /// Replaces the value list of entry `index`, keeping it in its extension
    /// block when it still belongs there.
    async fn store_values(
        &mut self,
        path: &[PathStep],
        mut leaf: LeafRecord,
        index: usize,
        values: Vec<EntryValue>,
    ) -> Result<(), TreeError> {
        if let LeafValues::External(pointer) = leaf.entries[index].values
            && self.format().small_leafs
            && values_len(&values) > MAX_INLINE_VALUE_BYTES
            && let Some(updated) = self.rewrite_ext_block(&mut leaf, pointer, &values).await?
        {
            leaf.entries[index].values = LeafValues::External(updated);
            return self.write_leaf(path, leaf).await;
        }
        leaf.entries[index].values = LeafValues::Inline(values);
        self.write_leaf(path, leaf).await
    }

    /// Writes `values` into their existing block, or into a new block in the
    /// leaf's spare extension bytes. `None` when neither has room.
    async fn rewrite_ext_block(
        &mut self,
        leaf: &mut LeafRecord,
        pointer: ExtPointer,
        values: &[EntryValue],
    ) -> Result<Option<ExtPointer>, TreeError> {
        let mut payload = Vec::new();
        encode_value_list(values, self.header.unique, &mut payload)?;
        let value_count = values.len() as u32;

        let (length, _) = self.nav.ext_block_header(pointer.block_index).await?;
        if payload.len() <= length as usize {
            self.batch.write(
                pointer.block_index,
                encode_ext_block(&payload, length as usize),
            );
            return Ok(Some(ExtPointer {
                value_count,
                block_index: pointer.block_index,
            }));
        }

        let ext_start = leaf.ext_start();
        let Some(region) = leaf.ext.as_mut() else {
            return Ok(None);
        };
        let spare = region.free_byte_length as usize;
        let needed = EXT_BLOCK_HEADER_LENGTH + payload.len();
        if needed > spare {
            return Ok(None);
        }
        let capacity = payload.len() + ext_block_growth(payload.len()).min(spare - needed);
        let block_index = ext_start + u64::from(region.length - region.free_byte_length);
        self.batch
            .write(block_index, encode_ext_block(&payload, capacity));
        region.free_byte_length -= (EXT_BLOCK_HEADER_LENGTH + capacity) as u32;
        Ok(Some(ExtPointer {
            value_count,
            block_index,
        }))
    }

    /// Stages `leaf` with its current entries, falling back to a full rewrite
    /// and then to a new allocation.
    async fn write_leaf(&mut self, path: &[PathStep], leaf: LeafRecord) -> Result<(), TreeError> {
        let format = self.format();
        match leaf.encode_primary(format) {
            Ok(bytes) => {
                self.batch.write(leaf.index, bytes);
                return Ok(());
            }
            Err(e) if e.is_capacity() => {}
            Err(e) => return Err(e.into()),
        }

        let entries = self.nav.load_all(&leaf).await?;
        match leaf.encode_full(&entries, format) {
            Ok(encoded) => {
                self.batch.write(leaf.index, encoded.into_bytes());
                Ok(())
            }
            Err(e) if e.is_capacity() => {
                if path.is_empty() {
                    self.grow_root_leaf(&leaf, entries).await
                } else {
                    self.relocate_leaf(path, &leaf, &entries).await
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Splits a leaf holding more entries than a node allows.
    async fn split_leaf(&mut self, path: &[PathStep], leaf: LeafRecord) -> Result<(), TreeError> {
        let mut left_entries = self.nav.load_all(&leaf).await?;
        let Some((parent_step, ancestors)) = path.split_last() else {
            return self.grow_root_leaf(&leaf, left_entries).await;
        };
        let format = self.format();
        let cut = self.split_point(left_entries.len(), leaf.next_leaf.is_none());
        let right_entries = left_entries.split_off(cut);

        let mut left = LeafRecord {
            entries: Vec::new(),
            ..leaf.clone()
        };
        let relocated = match left.encode_full(&left_entries, format) {
            Ok(_) => false,
            Err(e) if e.is_capacity() => true,
            Err(e) => return Err(e.into()),
        };
        if relocated {
            left = self.place_leaf(&left_entries)?;
            left.prev_leaf = leaf.prev_leaf;
            self.release(leaf.index, leaf.footprint());
        }
        let mut right = self.place_leaf(&right_entries)?;
        right.prev_leaf = Some(left.index);
        right.next_leaf = leaf.next_leaf;
        left.next_leaf = Some(right.index);
        self.stage_leaf(&left, &left_entries)?;
        self.stage_leaf(&right, &right_entries)?;

        if let Some(next) = leaf.next_leaf {
            self.stage_pointer(prev_pointer_position(next), Some(right.index))?;
        }
        if relocated && let Some(prev) = leaf.prev_leaf {
            self.stage_pointer(
                next_pointer_position(prev, format.width),
                Some(left.index),
            )?;
        }

        let separator = right_entries
            .first()
            .map(|e| e.key.clone())
            .ok_or_else(|| TreeError::InvalidArgument("split produced an empty leaf".into()))?;
        tracing::debug!(
            "split leaf {} at {} into {} + {} entries",
            leaf.index,
            separator,
            left_entries.len(),
            right_entries.len()
        );
        let mut parent = parent_step.node.clone();
        parent.insert_separator(parent_step.slot, separator, left.index, right.index);
        self.stage_node(ancestors, parent)
    }

    /// Turns the root leaf into a one-entry root node over two new leaves.
    /// The root keeps its position.
    async fn grow_root_leaf(
        &mut self,
        leaf: &LeafRecord,
        mut left_entries: Vec<LeafEntry>,
    ) -> Result<(), TreeError> {
        let cut = self.split_point(left_entries.len(), true);
        let right_entries = left_entries.split_off(cut);
        let Some(separator) = right_entries.first().map(|e| e.key.clone()) else {
            return Err(TreeError::InvalidArgument(
                "cannot grow an empty root leaf".into(),
            ));
        };

        let mut left = self.place_leaf(&left_entries)?;
        let mut right = self.place_leaf(&right_entries)?;
        left.next_leaf = Some(right.index);
        right.prev_leaf = Some(left.index);
        self.stage_leaf(&left, &left_entries)?;
        self.stage_leaf(&right, &right_entries)?;

        let root = NodeRecord {
            index: leaf.index,
            byte_length: leaf.byte_length,
            free_byte_length: 0,
            entries: vec![NodeEntry {
                key: separator,
                lt_child: left.index,
            }],
            gt_child: right.index,
        };
        self.batch
            .write(root.index, root.encode(self.format().width)?);
        if leaf.ext_length() > 0 {
            self.release(leaf.ext_start(), u64::from(leaf.ext_length()));
        }
        tracing::debug!(
            "root leaf became a node over leaves {} and {}",
            left.index,
            right.index
        );
        Ok(())
    }

    /// Moves a leaf that no longer fits its allocation.
    async fn relocate_leaf(
        &mut self,
        path: &[PathStep],
        leaf: &LeafRecord,
        entries: &[LeafEntry],
    ) -> Result<(), TreeError> {
        let Some((parent_step, _)) = path.split_last() else {
            return Err(TreeError::InvalidArgument("the root leaf cannot move".into()));
        };
        let width = self.format().width;
        let mut record = self.place_leaf(entries)?;
        record.prev_leaf = leaf.prev_leaf;
        record.next_leaf = leaf.next_leaf;
        self.stage_leaf(&record, entries)?;
        self.release(leaf.index, leaf.footprint());

        if let Some(prev) = leaf.prev_leaf {
            self.stage_pointer(next_pointer_position(prev, width), Some(record.index))?;
        }
        if let Some(next) = leaf.next_leaf {
            self.stage_pointer(prev_pointer_position(next), Some(record.index))?;
        }
        let mut parent = parent_step.node.clone();
        parent.set_child(parent_step.slot, record.index);
        self.batch.write(parent.index, parent.encode(width)?);
        tracing::debug!("relocated leaf {} to {}", leaf.index, record.index);
        Ok(())
    }

    /// Unlinks an empty leaf from its parent and the leaf chain.
    fn remove_leaf(&mut self, path: &[PathStep], leaf: &LeafRecord) -> Result<(), TreeError> {
        let Some((parent_step, _)) = path.split_last() else {
            return Err(TreeError::LeafEmpty);
        };
        let mut parent = parent_step.node.clone();
        if !parent.remove_child(parent_step.slot) {
            return Err(TreeError::LeafEmpty);
        }
        let width = self.format().width;
        self.batch.write(parent.index, parent.encode(width)?);
        if let Some(prev) = leaf.prev_leaf {
            self.stage_pointer(next_pointer_position(prev, width), leaf.next_leaf)?;
        }
        if let Some(next) = leaf.next_leaf {
            self.stage_pointer(prev_pointer_position(next), leaf.prev_leaf)?;
        }
        self.release(leaf.index, leaf.footprint());
        Ok(())
    }

    /// Splits a full node around its middle separator. `ancestors` is the
    /// path down to the node's parent; empty means `node` is the root, which
    /// is split in place under a new one-entry root.
    async fn split_node(&mut self, ancestors: &[PathStep], node: NodeRecord) -> Result<(), TreeError> {
        let count = node.entries.len();
        if count < 3 {
            return Err(TreeError::InvalidArgument(format!(
                "node at {} has too few entries to split",
                node.index
            )));
        }
        let mid = count / 2;
        let separator = node.entries[mid].key.clone();
        let left_gt = node.entries[mid].lt_child;
        let right_entries = node.entries[mid + 1..].to_vec();
        let left_entries = node.entries[..mid].to_vec();
        let width = self.format().width;

        let right = self.place_node(right_entries, node.gt_child)?;
        let Some((parent_step, grandparents)) = ancestors.split_last() else {
            let left = self.place_node(left_entries, left_gt)?;
            let root = NodeRecord {
                entries: vec![NodeEntry {
                    key: separator,
                    lt_child: left,
                }],
                gt_child: right,
                ..node
            };
            self.batch.write(root.index, root.encode(width)?);
            tracing::debug!("split root node into {left} and {right}");
            return Ok(());
        };

        let left = NodeRecord {
            entries: left_entries,
            gt_child: left_gt,
            ..node
        };
        self.batch.write(left.index, left.encode(width)?);
        let mut parent = parent_step.node.clone();
        parent.insert_separator(parent_step.slot, separator, left.index, right);
        tracing::debug!("split node {} with new sibling {right}", left.index);
        self.stage_node(grandparents, parent)
    }

    /// Moves the root's separators into a new node and leaves the root
    /// pointing at it alone, so they can keep growing outside the root's
    /// fixed allocation.
    fn push_down_root(&mut self, mut root: NodeRecord) -> Result<(), TreeError> {
        let entries = std::mem::take(&mut root.entries);
        root.gt_child = self.place_node(entries, root.gt_child)?;
        self.batch
            .write(root.index, root.encode(self.format().width)?);
        tracing::debug!("moved root separators into node {}", root.gt_child);
        Ok(())
    }

    /// Stages a node, moving it when it outgrew its allocation. The root
    /// cannot move and reports [`LayoutError::NodeTooSmall`] instead.
    fn stage_node(&mut self, ancestors: &[PathStep], mut node: NodeRecord) -> Result<(), TreeError> {
        let width = self.format().width;
        let error = match node.encode(width) {
            Ok(bytes) => {
                self.batch.write(node.index, bytes);
                return Ok(());
            }
            Err(e @ LayoutError::NodeTooSmall { .. }) => e,
            Err(e) => return Err(e.into()),
        };
        let Some((parent_step, _)) = ancestors.split_last() else {
            return Err(error.into());
        };

        let old = (node.index, u64::from(node.byte_length));
        let content = node.content_length(width);
        let growth = growth_bytes(
            content - NODE_HEADER_LENGTH,
            node.entries.len(),
            self.capacity(),
        );
        node.byte_length = (content + growth) as u32;
        node.index = self.allocate(content + growth)?;
        self.batch.write(node.index, node.encode(width)?);
        self.release(old.0, old.1);

        let mut parent = parent_step.node.clone();
        parent.set_child(parent_step.slot, node.index);
        self.batch.write(parent.index, parent.encode(width)?);
        tracing::debug!("relocated node {} to {}", old.0, node.index);
        Ok(())
    }

    /// Allocates and stages a new node.
    fn place_node(&mut self, entries: Vec<NodeEntry>, gt_child: u64) -> Result<u64, TreeError> {
        let width = self.format().width;
        let mut node = NodeRecord {
            index: 0,
            byte_length: 0,
            free_byte_length: 0,
            entries,
            gt_child,
        };
        let content = node.content_length(width);
        let length = content
            + growth_bytes(
                content - NODE_HEADER_LENGTH,
                node.entries.len(),
                self.capacity(),
            );
        node.byte_length = length as u32;
        node.index = self.allocate(length)?;
        self.batch.write(node.index, node.encode(width)?);
        Ok(node.index)
    }

    /// Allocates an unwritten leaf sized for `entries` plus room to grow.
    fn place_leaf(&mut self, entries: &[LeafEntry]) -> Result<LeafRecord, TreeError> {
        let size = LeafRecord::measure(entries, self.format());
        let (primary, ext) = size.allocation(entries.len(), self.capacity());
        let index = self.allocate(primary + ext)?;
        Ok(LeafRecord::empty(index, primary as u32, ext as u32))
    }

    fn stage_leaf(&mut self, leaf: &LeafRecord, entries: &[LeafEntry]) -> Result<(), TreeError> {
        let encoded = leaf.encode_full(entries, self.format())?;
        self.batch.write(leaf.index, encoded.into_bytes());
        Ok(())
    }

    fn stage_pointer(&mut self, field: u64, target: Option<u64>) -> Result<(), TreeError> {
        let bytes = encode_pointer(field, target, self.format().width)?;
        self.batch.write(field, bytes);
        Ok(())
    }

    fn release(&mut self, offset: u64, length: u64) {
        self.released.push((offset, length));
    }

    /// Entries kept in the left half when splitting `len` entries. The last
    /// leaf is cut at the fill factor so ascending inserts leave dense leaves.
    fn split_point(&self, len: usize, is_last: bool) -> usize {
        if !is_last {
            return len / 2;
        }
        if len < 2 {
            return 0;
        }
        (self.capacity() * usize::from(self.header.fill_factor) / 100).clamp(1, len - 1)
    }

    /// Finds room for `length` bytes: reclaimed ranges first, then the
    /// trailing free region, then by growing the tree.
    fn allocate(&mut self, length: usize) -> Result<u64, TreeError> {
        let requested = length as u64;
        if let Some(at) = self.free.allocate(requested) {
            return Ok(at);
        }
        let at = u64::from(self.header.used_length());
        let trailing = u64::from(self.header.free_byte_length);
        if requested <= trailing {
            self.header.free_byte_length -= length as u32;
            return Ok(at);
        }
        if !self.config.auto_grow {
            return Err(TreeError::TreeFullNoAutogrow { requested });
        }

        let reserve = u64::from(self.header.byte_length) / 10;
        let byte_length = u32::try_from(at + requested + reserve)
            .map_err(|_| TreeError::TreeFullNoAutogrow { requested })?;
        self.batch
            .write(at + requested, vec![0; reserve as usize]);
        tracing::debug!(
            "growing tree from {} to {} bytes",
            self.header.byte_length,
            byte_length
        );
        self.header.byte_length = byte_length;
        self.header.free_byte_length = reserve as u32;
        Ok(at)
    }
}

/// Depth of the highest node in an unbroken run of full nodes directly above
/// the leaf, if the leaf's parent is full.
fn topmost_full(path: &[PathStep], capacity: usize) -> Option<usize> {
    let mut depth = None;
    for (i, step) in path.iter().enumerate().rev() {
        if step.node.entries.len() < capacity {
            break;
        }
        depth = Some(i);
    }
    depth
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::config::TreeOptions;
    use crate::error::ErrorKind;
    use crate::memory::MemoryTree;
    use crate::storage::MemoryStorage;
    use crate::testing::FaultyStorage;

    fn value(name: &str) -> EntryValue {
        EntryValue::new(RecordPointer::from(name))
    }

    fn empty_tree(options: TreeOptions) -> MemoryStorage {
        let bytes = MemoryTree::new(options)
            .expect("tree")
            .to_binary()
            .expect("serialize");
        MemoryStorage::from_bytes(bytes)
    }

    async fn apply_all<S: ByteStorage>(storage: &S, operations: &[TreeOperation]) {
        let config = EngineConfig::default();
        let mut editor = Editor::open(storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        for operation in operations {
            editor.apply(operation).await.expect("apply");
        }
    }

    fn remove_number(i: u32) -> TreeOperation {
        TreeOperation::remove(Key::from(i), RecordPointer::from(i.to_string().as_str()))
    }

    /// Like [`apply_all`], but accepts removals that report a leaf left empty.
    /// Returns how many did.
    async fn remove_all<S: ByteStorage>(storage: &S, operations: &[TreeOperation]) -> usize {
        let config = EngineConfig::default();
        let mut editor = Editor::open(storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        let mut left_empty = 0;
        for operation in operations {
            match editor.apply(operation).await {
                Ok(()) => {}
                Err(TreeError::LeafEmpty) => left_empty += 1,
                Err(e) => panic!("{operation:?} failed: {e}"),
            }
        }
        left_empty
    }

    async fn chain<S: ByteStorage>(storage: &S) -> Vec<(Key, usize)> {
        let mut nav = Navigator::open(storage, 512).await.expect("nav");
        let mut leaf = nav.first_leaf().await.expect("first");
        let mut out = Vec::new();
        loop {
            for entry in nav.load_all(&leaf).await.expect("load") {
                out.push((entry.key.clone(), entry.values.len()));
            }
            match nav.next_leaf(&leaf).await.expect("next") {
                Some(next) => leaf = next,
                None => return out,
            }
        }
    }

    #[tokio::test]
    async fn test_split_at_small_capacity() {
        let storage = empty_tree(TreeOptions::new(true).with_max_entries_per_node(4));
        let adds: Vec<_> = (0..5u32)
            .map(|i| TreeOperation::add(Key::from(i), value(&format!("r{i}"))))
            .collect();
        apply_all(&storage, &adds).await;

        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        let root = nav.read_node(nav.header().root_index()).await.expect("root node");
        assert_eq!(root.entries.len(), 1);
        let left = nav.read_leaf(root.child(0)).await.expect("left");
        let right = nav.read_leaf(root.child(1)).await.expect("right");
        assert_eq!(left.next_leaf, Some(right.index));
        assert_eq!(right.prev_leaf, Some(left.index));
        assert_eq!(right.first_key(), Some(&root.entries[0].key));
        assert!(left.last_key().is_some_and(|k| *k < root.entries[0].key));
        assert_eq!(left.entries.len() + right.entries.len(), 5);
    }

    #[tokio::test]
    async fn test_random_churn_keeps_order() {
        crate::testing::init_tracing();
        let storage = empty_tree(TreeOptions::new(false).with_max_entries_per_node(8));
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys: Vec<String> = (0..1000).map(|i| format!("key-{i:05}")).collect();
        keys.shuffle(&mut rng);

        let adds: Vec<_> = keys
            .iter()
            .map(|k| TreeOperation::add(Key::from(k.as_str()), value(k)))
            .collect();
        apply_all(&storage, &adds).await;

        let listed = chain(&storage).await;
        assert_eq!(listed.len(), 1000);
        assert!(listed.windows(2).all(|w| w[0].0 < w[1].0));

        keys.shuffle(&mut rng);
        let removes: Vec<_> = keys
            .iter()
            .map(|k| {
                TreeOperation::remove(Key::from(k.as_str()), RecordPointer::from(k.as_str()))
            })
            .collect();
        assert!(remove_all(&storage, &removes).await > 0);

        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        let first = nav.first_leaf().await.expect("first");
        assert!(first.entries.is_empty());
        assert!(chain(&storage).await.is_empty());
    }

    #[tokio::test]
    async fn test_emptied_leaf_under_single_separator_is_reported() {
        let storage = empty_tree(TreeOptions::new(true).with_max_entries_per_node(4));
        let adds: Vec<_> = (0..5u32)
            .map(|i| TreeOperation::add(Key::from(i), value(&i.to_string())))
            .collect();
        apply_all(&storage, &adds).await;
        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        let in_first = nav.first_leaf().await.expect("first").entries.len() as u32;

        let config = EngineConfig::default();
        let mut editor = Editor::open(&storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        for i in 0..in_first - 1 {
            editor.apply(&remove_number(i)).await.expect("remove");
        }
        let last = in_first - 1;
        let err = editor.apply(&remove_number(last)).await.expect_err("leaf left empty");
        assert_eq!(err.kind(), ErrorKind::LeafEmpty);
        assert!(editor.finish().1);

        // the entry itself is gone and the empty leaf still heads the chain
        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        assert!(nav.first_leaf().await.expect("first").entries.is_empty());
        let keys: Vec<Key> = chain(&storage).await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (in_first..5).map(Key::from).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_leaf_flag_waits_for_commit() {
        let bytes = MemoryTree::new(TreeOptions::new(true).with_max_entries_per_node(4))
            .expect("tree")
            .to_binary()
            .expect("serialize");
        let storage = FaultyStorage::new(bytes);
        let adds: Vec<_> = (0..5u32)
            .map(|i| TreeOperation::add(Key::from(i), value(&i.to_string())))
            .collect();
        apply_all(&storage, &adds).await;
        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        let in_first = nav.first_leaf().await.expect("first").entries.len() as u32;

        let config = EngineConfig::default();
        let mut editor = Editor::open(&storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        for i in 0..in_first - 1 {
            editor.apply(&remove_number(i)).await.expect("remove");
        }
        storage.fail_nth_write(1);
        let last = in_first - 1;
        let err = editor.apply(&remove_number(last)).await.expect_err("commit fails");
        assert_eq!(err.kind(), ErrorKind::RolledBack);
        assert!(!editor.finish().1);
        assert_eq!(chain(&storage).await[0], (Key::from(last), 1));
    }

    #[tokio::test]
    async fn test_long_keys_grow_past_the_root() {
        use rand::Rng;

        let storage = empty_tree(TreeOptions::new(true).with_max_entries_per_node(4));
        let ascending: Vec<String> = (0..40).map(|i| format!("{i:0>200}")).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let mut mixed: Vec<String> = (0..40)
            .map(|i| {
                let len: usize = rng.random_range(200..=255);
                format!("{i:x>len$}")
            })
            .collect();
        mixed.shuffle(&mut rng);

        let adds: Vec<_> = ascending
            .iter()
            .chain(&mixed)
            .map(|k| TreeOperation::add(Key::from(k.as_str()), value(&k[k.len() - 4..])))
            .collect();
        apply_all(&storage, &adds).await;

        let listed: Vec<Key> = chain(&storage).await.into_iter().map(|(k, _)| k).collect();
        let mut expected: Vec<Key> = ascending
            .iter()
            .chain(&mixed)
            .map(|k| Key::from(k.as_str()))
            .collect();
        expected.sort();
        assert_eq!(listed, expected);

        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        for key in &expected {
            let leaf = nav.find_leaf(key).await.expect("leaf");
            assert!(leaf.search(key).is_ok(), "lost {key}");
        }
        assert!(nav.depth().await.expect("depth") >= 3);
    }

    #[tokio::test]
    async fn test_values_move_to_extension_and_back() {
        let storage = empty_tree(TreeOptions::new(false).with_max_entries_per_node(4));
        let adds: Vec<_> = (0..40)
            .map(|i| TreeOperation::add(Key::from("k"), value(&format!("record/{i:04}"))))
            .collect();
        apply_all(&storage, &adds).await;

        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        let leaf = nav.find_leaf(&Key::from("k")).await.expect("leaf");
        assert!(matches!(
            leaf.entries[0].values,
            LeafValues::External(ExtPointer { value_count: 40, .. })
        ));
        let values = nav.entry_values(&leaf.entries[0]).await.expect("values");
        assert_eq!(values[39], value("record/0039"));

        let removes: Vec<_> = (0..38)
            .map(|i| {
                let name = format!("record/{i:04}");
                TreeOperation::remove(Key::from("k"), RecordPointer::from(name.as_str()))
            })
            .collect();
        apply_all(&storage, &removes).await;
        assert_eq!(chain(&storage).await, vec![(Key::from("k"), 2)]);
    }

    #[tokio::test]
    async fn test_update_replaces_value() {
        let storage = empty_tree(TreeOptions::new(false));
        apply_all(&storage, &[
            TreeOperation::add(Key::from(1), value("a")),
            TreeOperation::add(Key::from(1), value("b")),
            TreeOperation::update(Key::from(1), value("c"), RecordPointer::from("a")),
        ])
        .await;

        let mut nav = Navigator::open(&storage, 512).await.expect("nav");
        let leaf = nav.find_leaf(&Key::from(1)).await.expect("leaf");
        let values = nav.entry_values(&leaf.entries[0]).await.expect("values");
        assert_eq!(values, vec![value("c"), value("b")]);
    }

    #[tokio::test]
    async fn test_rejected_operations() {
        let storage = empty_tree(TreeOptions::new(true));
        let config = EngineConfig::default();
        let mut editor = Editor::open(&storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        editor
            .apply(&TreeOperation::add(Key::from("a"), value("1")))
            .await
            .expect("add");

        let cases = [
            (
                TreeOperation::add(Key::from("a"), value("2")),
                ErrorKind::UniqueKeyViolation,
            ),
            (
                TreeOperation::remove(Key::from("b"), RecordPointer::from("1")),
                ErrorKind::KeyNotFound,
            ),
            (
                TreeOperation::remove(Key::from("a"), RecordPointer::from("9")),
                ErrorKind::ValueNotFound,
            ),
            (
                TreeOperation::add(Key::from("x".repeat(300).as_str()), value("3")),
                ErrorKind::KeyTooLong,
            ),
        ];
        for (operation, kind) in cases {
            let err = editor.apply(&operation).await.expect_err("rejected");
            assert_eq!(err.kind(), kind, "{operation:?}");
        }
    }

    #[tokio::test]
    async fn test_duplicate_value_rejected() {
        let storage = empty_tree(TreeOptions::new(false));
        let config = EngineConfig::default();
        let mut editor = Editor::open(&storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        let add = TreeOperation::add(Key::from("a"), value("1"));
        editor.apply(&add).await.expect("add");
        let err = editor.apply(&add).await.expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::DuplicateValue);
    }

    #[tokio::test]
    async fn test_no_autogrow_reports_full_tree() {
        let storage = empty_tree(
            TreeOptions::new(true)
                .with_max_entries_per_node(4)
                .with_free_space_percent(0),
        );
        let config = EngineConfig {
            auto_grow: false,
            ..EngineConfig::default()
        };
        let mut editor = Editor::open(&storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        let mut result = Ok(());
        for i in 0..5u32 {
            result = editor
                .apply(&TreeOperation::add(Key::from(i), value(&i.to_string())))
                .await;
            if result.is_err() {
                break;
            }
        }
        let err = result.expect_err("tree is full");
        assert_eq!(err.kind(), ErrorKind::TreeFullNoAutogrow);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_tree_untouched() {
        let bytes = MemoryTree::new(TreeOptions::new(true).with_max_entries_per_node(4))
            .expect("tree")
            .to_binary()
            .expect("serialize");
        let storage = FaultyStorage::new(bytes);
        apply_all(
            &storage,
            &(0..4u32)
                .map(|i| TreeOperation::add(Key::from(i), value(&i.to_string())))
                .collect::<Vec<_>>(),
        )
        .await;
        let before = storage.snapshot();

        // The fifth key splits the root leaf, touching several records.
        storage.fail_nth_write(2);
        let config = EngineConfig::default();
        let mut editor = Editor::open(&storage, &config, FreeSpaceTable::new())
            .await
            .expect("editor");
        let err = editor
            .apply(&TreeOperation::add(Key::from(4u32), value("4")))
            .await
            .expect_err("write fails");
        assert_eq!(err.kind(), ErrorKind::RolledBack);
        assert_eq!(storage.snapshot()[..before.len()], before[..]);
        assert!(editor.free_space().is_empty());

        storage.heal();
        editor
            .apply(&TreeOperation::add(Key::from(4u32), value("4")))
            .await
            .expect("retry");
        assert_eq!(chain(&storage).await.len(), 5);
    }

    #[test]
    fn test_topmost_full() {
        let node = |n: usize| NodeRecord {
            index: 0,
            byte_length: 0,
            free_byte_length: 0,
            entries: (0..n)
                .map(|i| NodeEntry {
                    key: Key::from(i as u32),
                    lt_child: 0,
                })
                .collect(),
            gt_child: 0,
        };
        let path = |sizes: &[usize]| -> Vec<PathStep> {
            sizes
                .iter()
                .map(|n| PathStep {
                    node: node(*n),
                    slot: 0,
                })
                .collect()
        };
        assert_eq!(topmost_full(&path(&[2, 4, 4]), 4), Some(1));
        assert_eq!(topmost_full(&path(&[4, 4]), 4), Some(0));
        assert_eq!(topmost_full(&path(&[4, 3]), 4), None);
        assert_eq!(topmost_full(&[], 4), None);
    }
}
