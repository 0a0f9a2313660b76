//! Binary tree engine: locked reads, searches and mutations over one
//! serialized tree held in a [`ByteStorage`].
//!
//! # Thread Safety
//!
//! A [`BinaryTree`] may be shared across tasks. Reads take a shared lock and
//! mutations an exclusive lock from the tree's [`LockManager`], keyed by the
//! tree id. Reads on a tree without an id skip locking; mutations require an
//! id and fail with `tree-id-not-set` otherwise.
//!
//! # Invariants
//!
//! - The free-space table only changes while the exclusive lock is held
//! - Every read operation works on its own read cache, so a read never sees
//!   bytes cached before a mutation committed
//! - Locks are released when their guard drops

pub mod commit;
pub mod free_space;
pub mod mutate;
pub mod navigator;
pub mod search;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::builder::{self, BuildSummary, RebuildOptions};
use crate::config::{EngineConfig, TreeOptions};
use crate::entry::{EntryValue, LeafEntry, RecordPointer};
use crate::error::TreeError;
use crate::key::Key;
use crate::layout::{ExtPointer, LeafRecord, LeafRecordEntry, TreeHeader};
use crate::lock::{LockError, LockManager, LockOptions, TreeLock, TreeLockManager};
use crate::memory::MemoryTree;
use crate::storage::{BuildWriter, ByteStorage};
use free_space::FreeSpaceTable;
use mutate::Editor;
use navigator::Navigator;

pub use mutate::TreeOperation;
pub use search::{
    BlacklistingSearchOperator, SearchOperator, SearchOptions, SearchResult, like_regex,
};

/// Shape and usage of a tree, gathered by walking its leaf chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub leaf_count: usize,
    pub entry_count: usize,
    pub value_count: usize,
    /// Levels including the leaf level.
    pub depth: usize,
    pub byte_length: u32,
    /// Unused bytes at the end of the tree.
    pub free_byte_length: u32,
    /// Bytes released by relocations and not reused yet.
    pub reclaimable_bytes: u64,
    pub empty_leaves: usize,
}

/// A serialized B+Tree with its storage, lock manager and runtime state.
pub struct BinaryTree<S, L = Arc<TreeLockManager>> {
    storage: S,
    locks: L,
    id: String,
    config: EngineConfig,
    free_space: Mutex<FreeSpaceTable>,
    kept_empty_leaf: AtomicBool,
}

impl<S: ByteStorage> BinaryTree<S> {
    /// A tree over `storage` guarded by its own in-process lock manager.
    pub fn new(storage: S, id: impl Into<String>) -> Self {
        Self::with_locks(storage, Arc::new(TreeLockManager::new()), id)
    }
}

impl<S: ByteStorage, L: LockManager> BinaryTree<S, L> {
    /// A tree over `storage` guarded by `locks`, which may be shared by
    /// several trees.
    pub fn with_locks(storage: S, locks: L, id: impl Into<String>) -> Self {
        Self {
            storage,
            locks,
            id: id.into(),
            config: EngineConfig::default(),
            free_space: Mutex::new(FreeSpaceTable::new()),
            kept_empty_leaf: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Writes an empty tree to `storage` and returns it opened.
    pub async fn create(
        storage: S,
        locks: L,
        id: impl Into<String>,
        options: TreeOptions,
    ) -> Result<Self, TreeError> {
        let bytes = MemoryTree::new(options)?.to_binary()?;
        storage.write(0, bytes).await?;
        Ok(Self::with_locks(storage, locks, id))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn read_lock(&self) -> Result<Option<L::Guard>, TreeError> {
        if self.id.is_empty() {
            return Ok(None);
        }
        let options = LockOptions::shared(self.config.lock_timeout);
        Ok(Some(self.locks.lock(&self.id, options).await?))
    }

    async fn write_lock(&self) -> Result<L::Guard, TreeError> {
        if self.id.is_empty() {
            return Err(LockError::MissingId.into());
        }
        let options = LockOptions::exclusive(self.config.lock_timeout);
        Ok(self.locks.lock(&self.id, options).await?)
    }

    async fn navigator(&self) -> Result<Navigator<'_, S>, TreeError> {
        Navigator::open(&self.storage, self.config.read_chunk_size).await
    }

    pub async fn header(&self) -> Result<TreeHeader, TreeError> {
        let _guard = self.read_lock().await?;
        let nav = self.navigator().await?;
        Ok(nav.header().clone())
    }

    /// Values stored under `key`, or `None` when the key is absent.
    pub async fn find(&self, key: &Key) -> Result<Option<Vec<EntryValue>>, TreeError> {
        let _guard = self.read_lock().await?;
        let mut nav = self.navigator().await?;
        let leaf = nav.find_leaf(key).await?;
        match leaf.search(key) {
            Ok(index) => nav.entry_values(&leaf.entries[index]).await.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// The leaf owning `key`.
    pub async fn find_leaf(&self, key: &Key) -> Result<LeafRecord, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.find_leaf(key).await
    }

    pub async fn first_leaf(&self) -> Result<LeafRecord, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.first_leaf().await
    }

    pub async fn last_leaf(&self) -> Result<LeafRecord, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.last_leaf().await
    }

    pub async fn next_leaf(&self, leaf: &LeafRecord) -> Result<Option<LeafRecord>, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.next_leaf(leaf).await
    }

    pub async fn prev_leaf(&self, leaf: &LeafRecord) -> Result<Option<LeafRecord>, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.prev_leaf(leaf).await
    }

    /// Values of an entry whose list lives in an extension block.
    pub async fn load_values(&self, pointer: ExtPointer) -> Result<Vec<EntryValue>, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.load_values(pointer).await
    }

    /// Every entry of `leaf` with its values loaded.
    pub async fn load_all(&self, leaf: &LeafRecord) -> Result<Vec<LeafEntry>, TreeError> {
        let _guard = self.read_lock().await?;
        self.navigator().await?.load_all(leaf).await
    }

    pub async fn search(
        &self,
        operator: &SearchOperator,
        options: &SearchOptions,
    ) -> Result<SearchResult, TreeError> {
        let _guard = self.read_lock().await?;
        let mut nav = self.navigator().await?;
        search::search(&mut nav, operator, options).await
    }

    /// Runs a blacklisting operator; its blacklist carries over to later runs.
    pub async fn search_blacklisting<F>(
        &self,
        operator: &mut BlacklistingSearchOperator<F>,
        options: &SearchOptions,
    ) -> Result<SearchResult, TreeError>
    where
        F: FnMut(&LeafEntry) -> Vec<EntryValue> + Send,
    {
        let _guard = self.read_lock().await?;
        let mut nav = self.navigator().await?;
        operator.run(&mut nav, options).await
    }

    pub async fn add(&self, key: Key, value: EntryValue) -> Result<(), TreeError> {
        self.apply(&mut VecDeque::from([TreeOperation::add(key, value)]))
            .await
    }

    pub async fn remove(&self, key: Key, record_pointer: RecordPointer) -> Result<(), TreeError> {
        self.apply(&mut VecDeque::from([TreeOperation::remove(
            key,
            record_pointer,
        )]))
        .await
    }

    /// Replaces the value stored as `current` under `key` with `value`.
    pub async fn update(
        &self,
        key: Key,
        value: EntryValue,
        current: RecordPointer,
    ) -> Result<(), TreeError> {
        self.apply(&mut VecDeque::from([TreeOperation::update(
            key, value, current,
        )]))
        .await
    }

    /// Applies queued operations in order under one exclusive lock. Each
    /// operation is removed from the queue once it committed, so on failure
    /// the failed operation and everything after it are still queued. A
    /// removal failing with `leaf-empty` did commit and is dequeued.
    pub async fn transaction(
        &self,
        operations: &mut VecDeque<TreeOperation>,
    ) -> Result<(), TreeError> {
        self.apply(operations).await
    }

    async fn apply(&self, operations: &mut VecDeque<TreeOperation>) -> Result<(), TreeError> {
        let guard = self.write_lock().await?;
        let result = self.apply_locked(operations).await;
        guard.release();
        result
    }

    async fn apply_locked(
        &self,
        operations: &mut VecDeque<TreeOperation>,
    ) -> Result<(), TreeError> {
        let free = self.free_table()?.clone();
        let mut editor = Editor::open(&self.storage, &self.config, free).await?;
        let mut result = Ok(());
        while let Some(operation) = operations.front() {
            match editor.apply(operation).await {
                Ok(()) => {}
                // The removal committed before the empty leaf was reported.
                Err(TreeError::LeafEmpty) => {
                    operations.pop_front();
                    result = Err(TreeError::LeafEmpty);
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            operations.pop_front();
        }
        let (free, kept_empty_leaf) = editor.finish();
        *self.free_table()? = free;
        if kept_empty_leaf {
            self.kept_empty_leaf.store(true, Ordering::Relaxed);
        }
        result
    }

    fn free_table(&self) -> Result<std::sync::MutexGuard<'_, FreeSpaceTable>, TreeError> {
        self.free_space
            .lock()
            .map_err(|_| LockError::Poisoned.into())
    }

    /// True once reclaimed space passes the configured threshold or a removal
    /// reported `leaf-empty`; a rebuild restores a compact tree.
    pub async fn needs_rebuild(&self) -> Result<bool, TreeError> {
        if self.kept_empty_leaf.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let header = self.header().await?;
        let fraction = self
            .free_table()?
            .fraction_of(u64::from(header.byte_length));
        Ok(fraction >= self.config.rebuild_threshold)
    }

    /// Walks the leaf chain and reports the tree's shape.
    pub async fn stats(&self) -> Result<TreeStats, TreeError> {
        let reclaimable_bytes = self.free_table()?.total();
        let _guard = self.read_lock().await?;
        let mut nav = self.navigator().await?;
        let mut stats = TreeStats {
            depth: nav.depth().await?,
            byte_length: nav.header().byte_length,
            free_byte_length: nav.header().free_byte_length,
            reclaimable_bytes,
            ..TreeStats::default()
        };
        let mut leaf = Some(nav.first_leaf().await?);
        while let Some(current) = leaf {
            stats.leaf_count += 1;
            stats.entry_count += current.entries.len();
            stats.value_count += current
                .entries
                .iter()
                .map(LeafRecordEntry::value_count)
                .sum::<usize>();
            if current.entries.is_empty() {
                stats.empty_leaves += 1;
            }
            leaf = nav.next_leaf(&current).await?;
        }
        Ok(stats)
    }

    /// Writes a compacted copy of the tree through `writer`.
    ///
    /// The copy is a separate tree: callers swap it in and open a new
    /// [`BinaryTree`] over it.
    pub async fn rebuild<W: BuildWriter>(
        &self,
        writer: &mut W,
        options: &RebuildOptions,
    ) -> Result<BuildSummary, TreeError> {
        let _guard = self.read_lock().await?;
        let mut nav = self.navigator().await?;
        builder::rebuild(&mut nav, writer, options).await
    }

    /// Record pointers of every value in the tree, for consistency checks.
    pub async fn record_pointers(&self) -> Result<HashSet<RecordPointer>, TreeError> {
        let result = self
            .search(&SearchOperator::Exists, &SearchOptions::default())
            .await?;
        let absent = self
            .search(&SearchOperator::NotExists, &SearchOptions::default())
            .await?;
        Ok(result
            .record_pointers()
            .chain(absent.record_pointers())
            .cloned()
            .collect())
    }
}
