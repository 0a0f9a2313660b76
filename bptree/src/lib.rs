// Life of a tree:
// 1. Built in memory (MemoryTree) or streamed from sorted entries (TreeBuilder)
// 2. Serialized into one relocatable byte range
// 3. Opened over a ByteStorage as a BinaryTree
//     - Reads decode records on demand through a chunked read cache
//     - Mutations stage record writes and commit them as one batch
// 4. Rebuilt into a compact copy once reclaimable space piles up
//
// System components:
//  - Key codec and entry values
//  - Binary layout (header, nodes, leaves, extension blocks)
//  - Navigator, search and mutation engine
//  - Lock manager keyed by tree id

pub mod builder;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod storage;
pub mod tree;

#[cfg(test)]
mod testing;

pub use builder::{BuildSummary, RebuildOptions, TreeBuilder};
pub use config::{ConfigError, EngineConfig, TreeOptions};
pub use entry::{EntryValue, LeafEntry, RecordPointer};
pub use error::{ErrorKind, TreeError};
pub use key::Key;
pub use lock::{LockError, LockManager, LockOptions, TreeLock, TreeLockManager};
pub use memory::MemoryTree;
pub use storage::{BuildWriter, ByteStorage, FileStorage, MemoryStorage, StorageWriter};
pub use tree::{
    BinaryTree, BlacklistingSearchOperator, SearchOperator, SearchOptions, SearchResult,
    TreeOperation, TreeStats,
};
