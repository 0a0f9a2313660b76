//! File-backed byte storage.
//!
//! A tree occupies a byte range of a larger file starting at `base_offset`,
//! so it can live inside a record-oriented database file. Positional reads
//! and writes (`pread`/`pwrite`) run on the blocking thread pool and never
//! move a shared cursor, so concurrent operations need no `&mut` access.

#![cfg(unix)]

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use super::{ByteStorage, StorageError};

/// A tree's byte range inside a file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    file: Arc<File>,
    base_offset: u64,
}

impl FileStorage {
    /// Creates (or truncates) a file holding a tree at offset 0.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
            base_offset: 0,
        })
    }

    /// Opens an existing file whose tree starts at `base_offset`.
    pub fn open(path: &Path, base_offset: u64) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
            base_offset,
        })
    }

    /// Flushes written data to disk.
    pub async fn sync(&self) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data()).await??;
        Ok(())
    }
}

impl ByteStorage for FileStorage {
    async fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let file = Arc::clone(&self.file);
        let position = self.base_offset + offset;
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; length];
            file.read_exact_at(&mut buf, position).map(|()| buf)
        })
        .await?;
        match result {
            Ok(buf) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(StorageError::OutOfBounds {
                    offset,
                    length,
                    size: self.len().await?,
                })
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn write(&self, offset: u64, bytes: Vec<u8>) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        let position = self.base_offset + offset;
        tokio::task::spawn_blocking(move || file.write_all_at(&bytes, position)).await??;
        Ok(())
    }

    async fn len(&self) -> Result<u64, StorageError> {
        let file = Arc::clone(&self.file);
        let total = tokio::task::spawn_blocking(move || file.metadata().map(|m| m.len())).await??;
        Ok(total.saturating_sub(self.base_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_storage_read_write() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tree.bin");
        let storage = FileStorage::create(&path).expect("create");
        storage.write(0, b"hello".to_vec()).await.expect("write");
        storage.write(10, b"world".to_vec()).await.expect("write");
        storage.sync().await.expect("sync");

        assert_eq!(storage.len().await.expect("len"), 15);
        assert_eq!(storage.read(10, 5).await.expect("read"), b"world");
        assert_eq!(storage.read(5, 5).await.expect("read"), vec![0; 5]);

        let err = storage.read(12, 10).await.expect_err("past end");
        assert!(matches!(err, StorageError::OutOfBounds { size: 15, .. }));
    }

    #[tokio::test]
    async fn test_base_offset() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db.bin");
        std::fs::write(&path, b"HEADER--tree").expect("seed file");

        let storage = FileStorage::open(&path, 8).expect("open");
        assert_eq!(storage.len().await.expect("len"), 4);
        assert_eq!(storage.read(0, 4).await.expect("read"), b"tree");
        storage.write(0, b"TREE".to_vec()).await.expect("write");
        assert_eq!(std::fs::read(&path).expect("read back"), b"HEADER--TREE");
    }
}
