//! Streaming construction of binary trees.
//!
//! A build makes two passes over entries in key order. The first pass keeps
//! only the first key of every future leaf; from those boundary keys the node
//! levels are planned bottom-up. The second pass writes the header and all
//! nodes with placeholder child pointers, streams the leaves behind them,
//! backpatches node children and leaf links, then appends trailing free space
//! and rewrites the header with the final lengths.
//!
//! Only boundary keys and one leaf's worth of entries are held in memory, so a
//! rebuild of a large tree reads its leaf chain twice instead of loading it.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;
use std::ops::Range;

use crate::config::TreeOptions;
use crate::entry::{EntryValue, LeafEntry};
use crate::error::TreeError;
use crate::key::Key;
use crate::layout::leaf::next_pointer_position;
use crate::layout::node::NODE_HEADER_LENGTH;
use crate::layout::{
    LeafRecord, NodeEntry, NodeRecord, RecordFormat, TreeHeader, encode_pointer, growth_bytes,
    min_root_length,
};
use crate::storage::{BuildWriter, ByteStorage};
use crate::tree::navigator::Navigator;

/// Counts reported by a finished build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub entry_count: usize,
    pub value_count: usize,
    pub leaf_count: usize,
    pub node_count: usize,
    /// Levels including the leaf level.
    pub depth: usize,
    pub byte_length: u32,
    pub free_byte_length: u32,
}

/// How a rebuild reshapes the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildOptions {
    /// Percentage by which `max_entries_per_node` grows (capped at 255).
    pub grow_percent: u8,
    /// New fill factor; the current one when `None`.
    pub fill_factor: Option<u8>,
    /// New trailing free-space percentage; the default when `None`.
    pub free_space_percent: Option<u8>,
}

impl RebuildOptions {
    /// Options for the rebuilt tree, derived from the current header.
    pub fn tree_options(&self, header: &TreeHeader) -> Result<TreeOptions, TreeError> {
        let max = usize::from(header.max_entries_per_node);
        let grown = (max + max * usize::from(self.grow_percent) / 100).min(usize::from(u8::MAX));
        let mut options = TreeOptions::new(header.unique)
            .with_max_entries_per_node(grown as u8)
            .with_fill_factor(self.fill_factor.unwrap_or(header.fill_factor));
        if let Some(percent) = self.free_space_percent {
            options = options.with_free_space_percent(percent);
        }
        options.metadata_keys.clone_from(&header.metadata_keys);
        options.validate()?;
        Ok(options)
    }
}

/// First pass: counts entries into leaves and remembers each leaf's first key.
#[derive(Debug)]
struct LeafPlanner {
    per_leaf: usize,
    in_leaf: usize,
    boundaries: Vec<Key>,
}

impl LeafPlanner {
    const fn new(per_leaf: usize) -> Self {
        Self {
            per_leaf,
            in_leaf: 0,
            boundaries: Vec::new(),
        }
    }

    fn observe(&mut self, key: &Key) {
        if self.in_leaf == self.per_leaf {
            self.boundaries.push(key.clone());
            self.in_leaf = 0;
        }
        self.in_leaf += 1;
    }
}

/// A planned node: its separator keys and the span of children it owns in
/// the level below.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodePlan {
    keys: Vec<Key>,
    children: Range<usize>,
}

/// Groups `boundaries.len() + 1` leaves into node levels, root level first.
/// Each node owns at most `capacity + 1` children and children are spread
/// evenly across the nodes of a level.
fn plan_levels(boundaries: Vec<Key>, capacity: usize) -> Vec<Vec<NodePlan>> {
    let mut levels = Vec::new();
    let mut separators = boundaries;
    let mut count = separators.len() + 1;
    while count > 1 {
        let nodes = count.div_ceil(capacity + 1);
        let (base, extra) = (count / nodes, count % nodes);
        let mut level = Vec::with_capacity(nodes);
        let mut promoted = Vec::with_capacity(nodes - 1);
        let mut start = 0;
        for n in 0..nodes {
            let end = start + base + usize::from(n < extra);
            if n > 0 {
                promoted.push(separators[start - 1].clone());
            }
            level.push(NodePlan {
                keys: separators[start..end - 1].to_vec(),
                children: start..end,
            });
            start = end;
        }
        levels.push(level);
        separators = promoted;
        count = nodes;
    }
    levels.reverse();
    levels
}

/// Second pass: writes planned nodes, then leaves as entries stream in.
struct StreamWriter<'w, W> {
    writer: &'w mut W,
    header: TreeHeader,
    format: RecordFormat,
    capacity: usize,
    per_leaf: usize,
    free_space_percent: u8,
    levels: Vec<Vec<NodeRecord>>,
    plans: Vec<Vec<NodePlan>>,
    leaf_count: usize,
    leaves: Vec<u64>,
    pending: Vec<LeafEntry>,
    summary: BuildSummary,
}

impl<'w, W: BuildWriter> StreamWriter<'w, W> {
    async fn begin(
        writer: &'w mut W,
        options: &TreeOptions,
        planner: LeafPlanner,
    ) -> Result<Self, TreeError> {
        let header = TreeHeader::new(
            options.unique,
            options.max_entries_per_node,
            options.fill_factor,
            options.metadata_keys.clone(),
        );
        let format = header.format();
        let capacity = usize::from(options.max_entries_per_node);
        let leaf_count = planner.boundaries.len() + 1;
        let plans = plan_levels(planner.boundaries, capacity);

        writer.append(header.encode()?).await?;
        let mut levels = Vec::with_capacity(plans.len());
        for (depth, plan) in plans.iter().enumerate() {
            let mut level = Vec::with_capacity(plan.len());
            for node in plan {
                let index = writer.position();
                let mut record = NodeRecord {
                    index,
                    byte_length: 0,
                    free_byte_length: 0,
                    entries: node
                        .keys
                        .iter()
                        .map(|key| NodeEntry {
                            key: key.clone(),
                            lt_child: index,
                        })
                        .collect(),
                    gt_child: index,
                };
                let content = record.content_length(format.width);
                let mut length = content
                    + growth_bytes(content - NODE_HEADER_LENGTH, node.keys.len(), capacity);
                if depth == 0 {
                    length = length.max(min_root_length(format.width));
                }
                record.byte_length = length as u32;
                writer.append(record.encode(format.width)?).await?;
                level.push(record);
            }
            levels.push(level);
        }

        Ok(Self {
            writer,
            header,
            format,
            capacity,
            per_leaf: options.entries_per_leaf(),
            free_space_percent: options.free_space_percent,
            summary: BuildSummary {
                node_count: levels.iter().map(Vec::len).sum(),
                depth: levels.len() + 1,
                ..BuildSummary::default()
            },
            levels,
            plans,
            leaf_count,
            leaves: Vec::with_capacity(leaf_count),
            pending: Vec::new(),
        })
    }

    async fn push(&mut self, entry: LeafEntry) -> Result<(), TreeError> {
        self.pending.push(entry);
        if self.pending.len() == self.per_leaf {
            self.flush_leaf().await?;
        }
        Ok(())
    }

    async fn flush_leaf(&mut self) -> Result<(), TreeError> {
        let entries = std::mem::take(&mut self.pending);
        let size = LeafRecord::measure(&entries, self.format);
        let (mut primary, ext) = size.allocation(entries.len(), self.capacity);
        if self.levels.is_empty() {
            primary = primary.max(min_root_length(self.format.width));
        }

        let index = self.writer.position();
        let mut record = LeafRecord::empty(index, primary as u32, ext as u32);
        record.prev_leaf = self.leaves.last().copied();
        self.writer
            .append(record.encode_full(&entries, self.format)?.into_bytes())
            .await?;
        if let Some(prev) = record.prev_leaf {
            let field = next_pointer_position(prev, self.format.width);
            self.writer
                .write_at(field, encode_pointer(field, Some(index), self.format.width)?)
                .await?;
        }

        self.leaves.push(index);
        self.summary.leaf_count += 1;
        self.summary.entry_count += entries.len();
        self.summary.value_count += entries.iter().map(LeafEntry::value_count).sum::<usize>();
        Ok(())
    }

    async fn finish(mut self) -> Result<BuildSummary, TreeError> {
        if !self.pending.is_empty() || self.leaves.is_empty() {
            self.flush_leaf().await?;
        }
        if self.leaves.len() != self.leaf_count {
            return Err(TreeError::InvalidArgument(format!(
                "entries changed between build passes: planned {} leaves, wrote {}",
                self.leaf_count,
                self.leaves.len()
            )));
        }

        // Children of the lowest node level are leaves, of every other level nodes.
        for depth in (0..self.levels.len()).rev() {
            let children: Vec<u64> = match self.levels.get(depth + 1) {
                Some(below) => below.iter().map(|n| n.index).collect(),
                None => self.leaves.clone(),
            };
            for (record, plan) in self.levels[depth].iter_mut().zip(&self.plans[depth]) {
                for (slot, child) in plan.children.clone().enumerate() {
                    record.set_child(slot, children[child]);
                }
                self.writer
                    .write_at(record.index, record.encode(self.format.width)?)
                    .await?;
            }
        }

        let used = self.writer.position() as usize;
        let free = used * usize::from(self.free_space_percent) / 100;
        self.writer.append(vec![0; free]).await?;
        self.header.byte_length = u32::try_from(used + free).map_err(|_| {
            TreeError::InvalidArgument(format!("tree of {} bytes is too large", used + free))
        })?;
        self.header.free_byte_length = free as u32;
        self.writer.write_at(0, self.header.encode()?).await?;

        self.summary.byte_length = self.header.byte_length;
        self.summary.free_byte_length = self.header.free_byte_length;
        Ok(self.summary)
    }
}

/// Collects entries in any order and builds a binary tree from them.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    options: TreeOptions,
    entries: BTreeMap<Key, Vec<EntryValue>>,
}

impl TreeBuilder {
    pub fn new(options: TreeOptions) -> Result<Self, TreeError> {
        options.validate()?;
        Ok(Self {
            options,
            entries: BTreeMap::new(),
        })
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, key: Key, value: EntryValue) -> Result<(), TreeError> {
        key.to_bytes()?;
        value.validate(self.options.metadata_keys.len())?;
        let Some(values) = self.entries.get_mut(&key) else {
            self.entries.insert(key, vec![value]);
            return Ok(());
        };
        if self.options.unique {
            return Err(TreeError::DuplicateKey(key));
        }
        if values.iter().any(|v| v.record_pointer == value.record_pointer) {
            return Err(TreeError::DuplicateValue {
                key,
                record_pointer: value.record_pointer,
            });
        }
        values.push(value);
        Ok(())
    }

    /// Writes the tree through `writer`, starting at its current position 0.
    pub async fn build<W: BuildWriter>(&self, writer: &mut W) -> Result<BuildSummary, TreeError> {
        let mut planner = LeafPlanner::new(self.options.entries_per_leaf());
        for key in self.entries.keys() {
            planner.observe(key);
        }
        let mut stream = StreamWriter::begin(writer, &self.options, planner).await?;
        for (key, values) in &self.entries {
            stream
                .push(LeafEntry::new(key.clone(), values.clone()))
                .await?;
        }
        let summary = stream.finish().await?;
        tracing::info!(
            "built tree: {} entries in {} leaves, {} bytes",
            summary.entry_count,
            summary.leaf_count,
            summary.byte_length
        );
        Ok(summary)
    }
}

/// Rebuilds the tree read by `nav` into `writer`, reading its leaf chain
/// twice. Empty leaves and fragmentation are dropped; the result always uses
/// the current format, so legacy trees become writable.
pub async fn rebuild<S: ByteStorage, W: BuildWriter>(
    nav: &mut Navigator<'_, S>,
    writer: &mut W,
    options: &RebuildOptions,
) -> Result<BuildSummary, TreeError> {
    let tree_options = options.tree_options(nav.header())?;

    let mut planner = LeafPlanner::new(tree_options.entries_per_leaf());
    let mut leaf = Some(nav.first_leaf().await?);
    while let Some(current) = leaf {
        for entry in &current.entries {
            planner.observe(&entry.key);
        }
        leaf = nav.next_leaf(&current).await?;
    }

    let mut stream = StreamWriter::begin(writer, &tree_options, planner).await?;
    let mut leaf = Some(nav.first_leaf().await?);
    while let Some(current) = leaf {
        for entry in nav.load_all(&current).await? {
            stream.push(entry).await?;
        }
        leaf = nav.next_leaf(&current).await?;
    }
    let summary = stream.finish().await?;
    tracing::info!(
        "rebuilt tree: {} entries in {} leaves, max {} entries per node, {} bytes",
        summary.entry_count,
        summary.leaf_count,
        tree_options.max_entries_per_node,
        summary.byte_length
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RecordPointer;
    use crate::error::ErrorKind;
    use crate::layout::LeafValues;
    use crate::storage::{MemoryStorage, StorageWriter};

    fn value(name: &str) -> EntryValue {
        EntryValue::new(RecordPointer::from(name))
    }

    async fn keys_forward(storage: &MemoryStorage) -> Vec<Key> {
        let mut nav = Navigator::open(storage, 1024).await.expect("nav");
        let mut out = Vec::new();
        let mut leaf = Some(nav.first_leaf().await.expect("first"));
        while let Some(current) = leaf {
            out.extend(current.entries.iter().map(|e| e.key.clone()));
            leaf = nav.next_leaf(&current).await.expect("next");
        }
        out
    }

    async fn keys_backward(storage: &MemoryStorage) -> Vec<Key> {
        let mut nav = Navigator::open(storage, 1024).await.expect("nav");
        let mut out = Vec::new();
        let mut leaf = Some(nav.last_leaf().await.expect("last"));
        while let Some(current) = leaf {
            out.extend(current.entries.iter().rev().map(|e| e.key.clone()));
            leaf = nav.prev_leaf(&current).await.expect("prev");
        }
        out
    }

    #[test]
    fn test_plan_levels_spreads_children() {
        let boundaries: Vec<Key> = (1..10u32).map(Key::from).collect();
        let levels = plan_levels(boundaries, 3);
        // 10 leaves -> 3 nodes (4,3,3) -> 1 root
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 1);
        assert_eq!(levels[0][0].keys, vec![Key::from(4u32), Key::from(7u32)]);
        let spans: Vec<_> = levels[1].iter().map(|n| n.children.clone()).collect();
        assert_eq!(spans, vec![0..4, 4..7, 7..10]);
        assert_eq!(levels[1][1].keys, vec![Key::from(5u32), Key::from(6u32)]);
    }

    #[test]
    fn test_plan_levels_single_leaf() {
        assert!(plan_levels(Vec::new(), 4).is_empty());
    }

    #[tokio::test]
    async fn test_build_in_any_order() {
        let options = TreeOptions::new(true).with_max_entries_per_node(4);
        let mut builder = TreeBuilder::new(options).expect("builder");
        for i in (0..100u32).rev() {
            builder
                .add(Key::from(i), value(&format!("r{i}")))
                .expect("add");
        }
        let storage = MemoryStorage::new();
        let summary = builder
            .build(&mut StorageWriter::new(storage.clone()))
            .await
            .expect("build");
        assert_eq!(summary.entry_count, 100);
        assert_eq!(summary.leaf_count, 34);
        assert!(summary.depth >= 3);
        assert_eq!(
            summary.byte_length as usize,
            storage.snapshot().expect("snapshot").len()
        );

        let expected: Vec<Key> = (0..100u32).map(Key::from).collect();
        assert_eq!(keys_forward(&storage).await, expected);
        let mut reversed = expected;
        reversed.reverse();
        assert_eq!(keys_backward(&storage).await, reversed);

        let mut nav = Navigator::open(&storage, 1024).await.expect("nav");
        let leaf = nav.find_leaf(&Key::from(57u32)).await.expect("leaf");
        let index = leaf.search(&Key::from(57u32)).expect("present");
        assert_eq!(
            nav.entry_values(&leaf.entries[index]).await.expect("values"),
            vec![value("r57")]
        );
    }

    #[tokio::test]
    async fn test_empty_build_has_root_leaf() {
        let builder = TreeBuilder::new(TreeOptions::new(false)).expect("builder");
        let storage = MemoryStorage::new();
        let summary = builder
            .build(&mut StorageWriter::new(storage.clone()))
            .await
            .expect("build");
        assert_eq!(summary.leaf_count, 1);
        assert_eq!(summary.depth, 1);
        let mut nav = Navigator::open(&storage, 1024).await.expect("nav");
        let root = nav.first_leaf().await.expect("root");
        assert!(root.entries.is_empty());
        assert!(root.footprint() as usize >= min_root_length(nav.header().pointer_width()));
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut unique = TreeBuilder::new(TreeOptions::new(true)).expect("builder");
        unique.add(Key::from("a"), value("1")).expect("add");
        let err = unique.add(Key::from("a"), value("2")).expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);

        let mut multi = TreeBuilder::new(TreeOptions::new(false)).expect("builder");
        multi.add(Key::from("a"), value("1")).expect("add");
        multi.add(Key::from("a"), value("2")).expect("add");
        let err = multi.add(Key::from("a"), value("1")).expect_err("dup value");
        assert_eq!(err.kind(), ErrorKind::DuplicateValue);
        assert_eq!(multi.len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_grows_capacity_and_keeps_ext_values() {
        let options = TreeOptions::new(false).with_max_entries_per_node(10);
        let mut builder = TreeBuilder::new(options).expect("builder");
        for i in 0..50u32 {
            builder.add(Key::from(i), value(&format!("r{i}"))).expect("add");
        }
        for n in 0..30 {
            builder
                .add(Key::from(7u32), value(&format!("extra-record-{n:03}")))
                .expect("add");
        }
        let source = MemoryStorage::new();
        builder
            .build(&mut StorageWriter::new(source.clone()))
            .await
            .expect("build");

        let target = MemoryStorage::new();
        let mut nav = Navigator::open(&source, 1024).await.expect("nav");
        let rebuild_options = RebuildOptions {
            grow_percent: 50,
            fill_factor: Some(80),
            free_space_percent: Some(25),
        };
        let summary = rebuild(&mut nav, &mut StorageWriter::new(target.clone()), &rebuild_options)
            .await
            .expect("rebuild");
        assert_eq!(summary.entry_count, 50);
        assert_eq!(summary.value_count, 80);

        let mut rebuilt = Navigator::open(&target, 1024).await.expect("nav");
        assert_eq!(rebuilt.header().max_entries_per_node, 15);
        assert_eq!(rebuilt.header().fill_factor, 80);
        assert_eq!(
            rebuilt.header().free_byte_length,
            rebuilt.header().used_length() / 4
        );
        let leaf = rebuilt.find_leaf(&Key::from(7u32)).await.expect("leaf");
        let index = leaf.search(&Key::from(7u32)).expect("present");
        assert!(matches!(leaf.entries[index].values, LeafValues::External(_)));
        assert_eq!(
            rebuilt
                .entry_values(&leaf.entries[index])
                .await
                .expect("values")
                .len(),
            31
        );
        assert_eq!(keys_forward(&target).await, keys_forward(&source).await);
    }
}
