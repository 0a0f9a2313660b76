//! Byte-range storage abstraction.
//!
//! The tree engine never touches files directly. It reads and writes byte
//! ranges through [`ByteStorage`], and fresh builds stream through an
//! append-capable [`BuildWriter`].
//!
//! # Design
//!
//! Every read and write is an asynchronous suspension point. Implementations
//! may delay arbitrarily but must eventually resolve or fail; the engine never
//! polls or busy-waits. Writes past the current end extend the storage.

pub mod file;
pub mod memory;
pub mod reader;

use std::future::Future;

#[cfg(unix)]
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use reader::ChunkedReader;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Read beyond the end of the storage.
    OutOfBounds { offset: u64, length: usize, size: u64 },
    /// Injected fault for simulation.
    InjectedFault(String),
    /// A blocking I/O task panicked or was cancelled.
    TaskFailed(String),
    /// An internal lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OutOfBounds {
                offset,
                length,
                size,
            } => write!(
                f,
                "read of {length} bytes at {offset} out of bounds (size: {size})"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::TaskFailed(msg) => write!(f, "I/O task failed: {msg}"),
            Self::LockPoisoned => write!(f, "storage lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskFailed(e.to_string())
    }
}

/// Random-access byte storage holding one tree.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read` returns the last written content of the range
/// - `read` fails with [`StorageError::OutOfBounds`] past the end
/// - `write` past the end extends the storage, zero-filling any gap
pub trait ByteStorage: Send + Sync {
    /// Reads `length` bytes starting at `offset`.
    fn read(
        &self,
        offset: u64,
        length: usize,
    ) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send;

    /// Writes `bytes` at `offset`.
    fn write(
        &self,
        offset: u64,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Current size in bytes.
    fn len(&self) -> impl Future<Output = Result<u64, StorageError>> + Send;
}

impl<S: ByteStorage> ByteStorage for std::sync::Arc<S> {
    fn read(
        &self,
        offset: u64,
        length: usize,
    ) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send {
        (**self).read(offset, length)
    }

    fn write(
        &self,
        offset: u64,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        (**self).write(offset, bytes)
    }

    fn len(&self) -> impl Future<Output = Result<u64, StorageError>> + Send {
        (**self).len()
    }
}

/// Append-capable writer used by builds and rebuilds.
pub trait BuildWriter: Send {
    /// Appends `bytes`, returning the position they were written at.
    fn append(&mut self, bytes: Vec<u8>)
    -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Overwrites already appended bytes at `offset`.
    fn write_at(
        &mut self,
        offset: u64,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Position the next append will write at.
    fn position(&self) -> u64;
}

/// Streams a build into any [`ByteStorage`], starting at position 0.
#[derive(Debug)]
pub struct StorageWriter<S> {
    storage: S,
    position: u64,
}

impl<S: ByteStorage> StorageWriter<S> {
    pub const fn new(storage: S) -> Self {
        Self {
            storage,
            position: 0,
        }
    }

    /// Returns the underlying storage.
    pub fn into_inner(self) -> S {
        self.storage
    }
}

impl<S: ByteStorage> BuildWriter for StorageWriter<S> {
    async fn append(&mut self, bytes: Vec<u8>) -> Result<u64, StorageError> {
        let at = self.position;
        let len = bytes.len() as u64;
        self.storage.write(at, bytes).await?;
        self.position += len;
        Ok(at)
    }

    async fn write_at(&mut self, offset: u64, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.storage.write(offset, bytes).await
    }

    fn position(&self) -> u64 {
        self.position
    }
}
