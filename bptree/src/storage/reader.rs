//! Chunked, cached reads over a [`ByteStorage`].
//!
//! One reader lives for the duration of a single traversal. Reads are rounded
//! out to whole chunks so that walking neighbouring records costs one storage
//! round trip per chunk instead of one per field.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;

use super::{ByteStorage, StorageError};

/// Read cache keyed by chunk number.
#[derive(Debug)]
pub struct ChunkedReader<'a, S> {
    storage: &'a S,
    chunk_size: usize,
    chunks: HashMap<u64, Vec<u8>>,
    size: Option<u64>,
}

impl<'a, S: ByteStorage> ChunkedReader<'a, S> {
    #[must_use]
    pub fn new(storage: &'a S, chunk_size: usize) -> Self {
        Self {
            storage,
            chunk_size: chunk_size.max(1),
            chunks: HashMap::new(),
            size: None,
        }
    }

    /// Storage size as of the first read since the last invalidation.
    pub async fn size(&mut self) -> Result<u64, StorageError> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = self.storage.len().await?;
        self.size = Some(size);
        Ok(size)
    }

    /// Drops all cached bytes, typically after the storage was written.
    pub fn invalidate(&mut self) {
        self.chunks.clear();
        self.size = None;
    }

    /// Reads `length` bytes at `offset`, fetching missing chunks.
    pub async fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let size = self.size().await?;
        let end = offset + length as u64;
        if end > size {
            return Err(StorageError::OutOfBounds {
                offset,
                length,
                size,
            });
        }

        let chunk = self.chunk_size as u64;
        let first = offset / chunk;
        let last = (end - 1) / chunk;
        let mut missing = (first..=last).filter(|n| !self.chunks.contains_key(n));
        if let Some(from) = missing.next() {
            let to = missing.last().unwrap_or(from);
            let start = from * chunk;
            let stop = ((to + 1) * chunk).min(size);
            let bytes = self.storage.read(start, (stop - start) as usize).await?;
            for (i, piece) in bytes.chunks(self.chunk_size).enumerate() {
                self.chunks.entry(from + i as u64).or_insert_with(|| piece.to_vec());
            }
        }

        let mut out = Vec::with_capacity(length);
        for n in first..=last {
            let data = self.chunks.get(&n).ok_or(StorageError::OutOfBounds {
                offset,
                length,
                size,
            })?;
            let chunk_start = n * chunk;
            let from = offset.saturating_sub(chunk_start) as usize;
            let to = ((end - chunk_start) as usize).min(data.len());
            out.extend_from_slice(&data[from..to]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_reads_across_chunks() {
        let bytes: Vec<u8> = (0..100).collect();
        let storage = MemoryStorage::from_bytes(bytes.clone());
        let mut reader = ChunkedReader::new(&storage, 16);
        assert_eq!(reader.read(10, 30).await.expect("read"), bytes[10..40]);
        assert_eq!(reader.read(90, 10).await.expect("read"), bytes[90..100]);
        assert_eq!(reader.read(0, 1).await.expect("read"), vec![0]);
    }

    #[tokio::test]
    async fn test_cache_is_used_until_invalidated() {
        let storage = MemoryStorage::from_bytes(vec![1; 64]);
        let mut reader = ChunkedReader::new(&storage, 32);
        assert_eq!(reader.read(0, 4).await.expect("read"), vec![1; 4]);

        storage.write(0, vec![2; 4]).await.expect("write");
        assert_eq!(reader.read(0, 4).await.expect("cached"), vec![1; 4]);

        reader.invalidate();
        assert_eq!(reader.read(0, 4).await.expect("fresh"), vec![2; 4]);
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let storage = MemoryStorage::from_bytes(vec![0; 10]);
        let mut reader = ChunkedReader::new(&storage, 4);
        assert!(matches!(
            reader.read(8, 4).await,
            Err(StorageError::OutOfBounds { size: 10, .. })
        ));
    }
}
