//! In-memory B+Tree used as scratch space before serialization.

pub mod node;
pub mod tree;

pub use node::{InternalNode, LeafNode, MemoryNode, NodeId};
pub use tree::MemoryTree;
