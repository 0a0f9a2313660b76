//! In-memory byte storage.

use std::sync::{Arc, Mutex};

use super::{ByteStorage, StorageError};

/// Growable in-memory byte range. Clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self
            .bytes
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone())
    }

    fn read_sync(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let bytes = self.bytes.lock().map_err(|_| StorageError::LockPoisoned)?;
        let size = bytes.len() as u64;
        let out_of_bounds = StorageError::OutOfBounds {
            offset,
            length,
            size,
        };
        let start = usize::try_from(offset).map_err(|_| StorageError::OutOfBounds {
            offset,
            length,
            size,
        })?;
        bytes
            .get(start..start.saturating_add(length))
            .map(<[u8]>::to_vec)
            .ok_or(out_of_bounds)
    }

    fn write_sync(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut bytes = self.bytes.lock().map_err(|_| StorageError::LockPoisoned)?;
        let start = usize::try_from(offset).map_err(|_| StorageError::OutOfBounds {
            offset,
            length: data.len(),
            size: bytes.len() as u64,
        })?;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }
}

impl ByteStorage for MemoryStorage {
    async fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        self.read_sync(offset, length)
    }

    async fn write(&self, offset: u64, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.write_sync(offset, &bytes)
    }

    async fn len(&self) -> Result<u64, StorageError> {
        Ok(self
            .bytes
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_extends_and_zero_fills() {
        let storage = MemoryStorage::new();
        storage.write(4, vec![7, 8]).await.expect("write");
        assert_eq!(storage.len().await.expect("len"), 6);
        assert_eq!(
            storage.read(0, 6).await.expect("read"),
            vec![0, 0, 0, 0, 7, 8]
        );
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let storage = MemoryStorage::from_bytes(vec![1, 2, 3]);
        let err = storage.read(2, 5).await.expect_err("out of bounds");
        assert!(matches!(err, StorageError::OutOfBounds { size: 3, .. }));
    }

    #[tokio::test]
    async fn test_clones_share_bytes() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.write(0, vec![42]).await.expect("write");
        assert_eq!(b.read(0, 1).await.expect("read"), vec![42]);
    }
}
