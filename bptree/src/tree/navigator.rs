//! Read path over a binary tree.
//!
//! The navigator decodes records on demand through a [`ChunkedReader`]; it
//! never writes. Records are addressed by their absolute position in the tree
//! and decoded into owned [`NodeRecord`]/[`LeafRecord`] values, so walking the
//! leaf chain or descending from the root needs no shared node graph.
//!
//! # Design
//!
//! Every record starts with `[byte_length: u32][flags: u8]`, so a record is
//! read in two steps: its 5-byte prefix, then its full primary region.
//! Extension blocks are only read when a caller asks for the values of an
//! entry stored there.

use crate::entry::{EntryValue, LeafEntry, decode_value_list};
use crate::error::TreeError;
use crate::key::Key;
use crate::layout::header::HEADER_PREFIX_LENGTH;
use crate::layout::leaf::{EXT_BLOCK_HEADER_LENGTH, decode_ext_block_header};
use crate::layout::{
    ExtPointer, LayoutError, LeafRecord, LeafRecordEntry, LeafValues, NodeRecord,
    RECORD_FLAG_IS_LEAF, RecordFormat, TreeHeader,
};
use crate::storage::{ByteStorage, ChunkedReader};

/// Bytes before a record's flags byte, flags included.
const RECORD_PREFIX_LENGTH: usize = 5;

/// A decoded record of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Node(NodeRecord),
    Leaf(LeafRecord),
}

/// One level of a root-to-leaf descent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub node: NodeRecord,
    /// Slot of the child the descent continued into.
    pub slot: usize,
}

/// Stateless reader of records, bound to one traversal's read cache.
pub struct Navigator<'a, S> {
    reader: ChunkedReader<'a, S>,
    header: TreeHeader,
}

impl<'a, S: ByteStorage> Navigator<'a, S> {
    /// Reads the tree header and prepares a navigator over `storage`.
    pub async fn open(storage: &'a S, chunk_size: usize) -> Result<Self, TreeError> {
        let mut reader = ChunkedReader::new(storage, chunk_size);
        let header = read_header(&mut reader).await?;
        Ok(Self { reader, header })
    }

    #[must_use]
    pub const fn header(&self) -> &TreeHeader {
        &self.header
    }

    #[must_use]
    pub fn format(&self) -> RecordFormat {
        self.header.format()
    }

    /// Forgets cached bytes and re-reads the header after the tree was written.
    pub async fn refresh(&mut self) -> Result<(), TreeError> {
        self.reader.invalidate();
        self.header = read_header(&mut self.reader).await?;
        Ok(())
    }

    /// Reads the record at `index`.
    pub async fn read_record(&mut self, index: u64) -> Result<Record, TreeError> {
        let prefix = self.reader.read(index, RECORD_PREFIX_LENGTH).await?;
        let byte_length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let is_leaf = prefix[4] & RECORD_FLAG_IS_LEAF != 0;
        let bytes = self.reader.read(index, byte_length as usize).await?;
        let format = self.format();
        Ok(if is_leaf {
            Record::Leaf(LeafRecord::decode(&bytes, index, format)?)
        } else {
            Record::Node(NodeRecord::decode(&bytes, index, format.width)?)
        })
    }

    pub async fn read_node(&mut self, index: u64) -> Result<NodeRecord, TreeError> {
        match self.read_record(index).await? {
            Record::Node(node) => Ok(node),
            Record::Leaf(_) => Err(LayoutError::UnexpectedRecord {
                index,
                expected_leaf: false,
            }
            .into()),
        }
    }

    pub async fn read_leaf(&mut self, index: u64) -> Result<LeafRecord, TreeError> {
        match self.read_record(index).await? {
            Record::Leaf(leaf) => Ok(leaf),
            Record::Node(_) => Err(LayoutError::UnexpectedRecord {
                index,
                expected_leaf: true,
            }
            .into()),
        }
    }

    /// The root record.
    pub async fn root(&mut self) -> Result<Record, TreeError> {
        let root = self.header.root_index();
        self.read_record(root).await
    }

    /// Descends from the root to the leaf owning `key`, recording the path.
    pub async fn find_leaf_path(
        &mut self,
        key: &Key,
    ) -> Result<(Vec<PathStep>, LeafRecord), TreeError> {
        self.descend(|node| node.child_slot_for(key)).await
    }

    /// The leaf owning `key`.
    pub async fn find_leaf(&mut self, key: &Key) -> Result<LeafRecord, TreeError> {
        Ok(self.find_leaf_path(key).await?.1)
    }

    /// The leftmost leaf, with the path leading to it.
    pub async fn first_leaf_path(&mut self) -> Result<(Vec<PathStep>, LeafRecord), TreeError> {
        self.descend(|_| 0).await
    }

    pub async fn first_leaf(&mut self) -> Result<LeafRecord, TreeError> {
        Ok(self.first_leaf_path().await?.1)
    }

    pub async fn last_leaf(&mut self) -> Result<LeafRecord, TreeError> {
        Ok(self.descend(|node| node.entries.len()).await?.1)
    }

    async fn descend(
        &mut self,
        choose: impl Fn(&NodeRecord) -> usize,
    ) -> Result<(Vec<PathStep>, LeafRecord), TreeError> {
        let mut path = Vec::new();
        let mut record = self.root().await?;
        loop {
            match record {
                Record::Leaf(leaf) => return Ok((path, leaf)),
                Record::Node(node) => {
                    let slot = choose(&node);
                    let child = node.child(slot);
                    path.push(PathStep { node, slot });
                    record = self.read_record(child).await?;
                }
            }
        }
    }

    /// Leaf following `leaf` in key order.
    pub async fn next_leaf(&mut self, leaf: &LeafRecord) -> Result<Option<LeafRecord>, TreeError> {
        match leaf.next_leaf {
            Some(index) => self.read_leaf(index).await.map(Some),
            None => Ok(None),
        }
    }

    /// Leaf preceding `leaf` in key order.
    pub async fn prev_leaf(&mut self, leaf: &LeafRecord) -> Result<Option<LeafRecord>, TreeError> {
        match leaf.prev_leaf {
            Some(index) => self.read_leaf(index).await.map(Some),
            None => Ok(None),
        }
    }

    /// `(block_length, block_free)` of the extension block at `block_index`.
    pub async fn ext_block_header(&mut self, block_index: u64) -> Result<(u32, u32), TreeError> {
        let bytes = self.reader.read(block_index, EXT_BLOCK_HEADER_LENGTH).await?;
        Ok(decode_ext_block_header(&bytes)?)
    }

    /// Reads the value list of an entry stored in an extension block.
    pub async fn load_values(&mut self, pointer: ExtPointer) -> Result<Vec<EntryValue>, TreeError> {
        let (length, free) = self.ext_block_header(pointer.block_index).await?;
        let data = self
            .reader
            .read(
                pointer.block_index + EXT_BLOCK_HEADER_LENGTH as u64,
                (length - free) as usize,
            )
            .await?;
        let format = self.format();
        Ok(decode_value_list(
            &data,
            format.unique,
            format.metadata_count,
        )?)
    }

    /// Values of `entry`, loading them from extension data if needed.
    pub async fn entry_values(
        &mut self,
        entry: &LeafRecordEntry,
    ) -> Result<Vec<EntryValue>, TreeError> {
        match &entry.values {
            LeafValues::Inline(values) => Ok(values.clone()),
            LeafValues::External(pointer) => self.load_values(*pointer).await,
        }
    }

    /// Every entry of `leaf` with its values loaded.
    pub async fn load_all(&mut self, leaf: &LeafRecord) -> Result<Vec<LeafEntry>, TreeError> {
        let mut entries = Vec::with_capacity(leaf.entries.len());
        for entry in &leaf.entries {
            let values = self.entry_values(entry).await?;
            entries.push(LeafEntry::new(entry.key.clone(), values));
        }
        Ok(entries)
    }

    /// Levels from the root to the leaves, the leaf level included.
    pub async fn depth(&mut self) -> Result<usize, TreeError> {
        Ok(self.first_leaf_path().await?.0.len() + 1)
    }
}

async fn read_header<S: ByteStorage>(
    reader: &mut ChunkedReader<'_, S>,
) -> Result<TreeHeader, TreeError> {
    let size = reader.size().await?;
    #[allow(clippy::cast_possible_truncation)]
    let prefix_length = size.min(HEADER_PREFIX_LENGTH as u64) as usize;
    let prefix = reader.read(0, prefix_length).await?;
    let length = TreeHeader::required_length(&prefix)?;
    let bytes = reader.read(0, length).await?;
    Ok(TreeHeader::decode(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeOptions;
    use crate::entry::RecordPointer;
    use crate::memory::MemoryTree;
    use crate::storage::MemoryStorage;

    fn value(rp: &str) -> EntryValue {
        EntryValue::new(RecordPointer::from(rp))
    }

    fn storage_with(keys: impl IntoIterator<Item = i32>, max: u8) -> MemoryStorage {
        let options = TreeOptions::new(true).with_max_entries_per_node(max);
        let tree = MemoryTree::from_entries(
            options,
            keys.into_iter()
                .map(|k| (Key::from(k), value(&format!("r{k}")))),
        )
        .expect("tree");
        MemoryStorage::from_bytes(tree.to_binary().expect("binary"))
    }

    async fn walk_forward(nav: &mut Navigator<'_, MemoryStorage>) -> Vec<Key> {
        let mut keys = Vec::new();
        let mut leaf = Some(nav.first_leaf().await.expect("first"));
        while let Some(current) = leaf {
            keys.extend(current.entries.iter().map(|e| e.key.clone()));
            leaf = nav.next_leaf(&current).await.expect("next");
        }
        keys
    }

    async fn walk_backward(nav: &mut Navigator<'_, MemoryStorage>) -> Vec<Key> {
        let mut keys = Vec::new();
        let mut leaf = Some(nav.last_leaf().await.expect("last"));
        while let Some(current) = leaf {
            keys.extend(current.entries.iter().rev().map(|e| e.key.clone()));
            leaf = nav.prev_leaf(&current).await.expect("prev");
        }
        keys
    }

    #[tokio::test]
    async fn test_leaf_chain_is_sorted_both_ways() {
        let storage = storage_with((0..200).rev(), 4);
        let mut nav = Navigator::open(&storage, 64).await.expect("open");
        let expected: Vec<Key> = (0..200).map(Key::from).collect();

        assert_eq!(walk_forward(&mut nav).await, expected);
        let mut backward = walk_backward(&mut nav).await;
        backward.reverse();
        assert_eq!(backward, expected);
        assert!(nav.depth().await.expect("depth") > 2);
    }

    #[tokio::test]
    async fn test_find_leaf_descends_to_owner() {
        let storage = storage_with(0..50, 4);
        let mut nav = Navigator::open(&storage, 4096).await.expect("open");
        for k in [0, 17, 49] {
            let key = Key::from(k);
            let (path, leaf) = nav.find_leaf_path(&key).await.expect("find");
            assert!(leaf.search(&key).is_ok(), "key {k} not in its leaf");
            for step in &path {
                assert_eq!(step.node.child_slot_for(&key), step.slot);
            }
        }
        let leaf = nav.find_leaf(&Key::from(1000)).await.expect("beyond");
        assert_eq!(leaf.next_leaf, None);
    }

    #[tokio::test]
    async fn test_single_leaf_root() {
        let storage = storage_with([3, 1, 2], 10);
        let mut nav = Navigator::open(&storage, 16).await.expect("open");
        assert!(matches!(nav.root().await.expect("root"), Record::Leaf(_)));
        assert_eq!(nav.depth().await.expect("depth"), 1);
        let leaf = nav.first_leaf().await.expect("first");
        assert_eq!(leaf.prev_leaf, None);
        assert_eq!(leaf.next_leaf, None);
        assert_eq!(leaf.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_ext_values_load_lazily() {
        let options = TreeOptions::new(false);
        let mut tree = MemoryTree::new(options).expect("tree");
        let long: Vec<String> = (0..40).map(|i| format!("records/{i:06}")).collect();
        for rp in &long {
            tree.add(Key::from("popular"), value(rp)).expect("add");
        }
        tree.add(Key::from("rare"), value("records/x")).expect("add");
        let storage = MemoryStorage::from_bytes(tree.to_binary().expect("binary"));

        let mut nav = Navigator::open(&storage, 128).await.expect("open");
        let leaf = nav.find_leaf(&Key::from("popular")).await.expect("leaf");
        let idx = leaf.search(&Key::from("popular")).expect("entry");
        let LeafValues::External(pointer) = leaf.entries[idx].values else {
            panic!("expected extension data");
        };
        assert_eq!(pointer.value_count, 40);
        let values = nav.load_values(pointer).await.expect("values");
        let loaded: Vec<String> = values.iter().map(|v| v.record_pointer.to_string()).collect();
        assert_eq!(loaded, long);

        let all = nav.load_all(&leaf).await.expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].values, vec![value("records/x")]);
    }

    #[tokio::test]
    async fn test_wrong_record_kind() {
        let storage = storage_with(0..3, 10);
        let mut nav = Navigator::open(&storage, 16).await.expect("open");
        let root = nav.header().root_index();
        let err = nav.read_node(root).await.expect_err("root is a leaf");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidByteLength);
    }
}
