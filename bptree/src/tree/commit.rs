//! All-or-nothing application of multi-record writes.
//!
//! A mutation is expressed as a list of [`Step`]s, each an action paired with
//! the rollback that undoes it. All actions run concurrently. If any action
//! fails, the rollback of every step runs (also concurrently) and the original
//! failure is reported as [`CommitError::RolledBack`]. A failing rollback
//! leaves the tree in an unknown state and is reported as
//! [`CommitError::RollbackFailed`], carrying both failures.
//!
//! # Design
//!
//! Rolling back a step whose action never took effect rewrites bytes that are
//! already in their original state, so rollbacks do not need to know which
//! actions completed.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};

use crate::error::ErrorKind;
use crate::storage::{ByteStorage, StorageError};

/// Failure of a committed step list.
#[derive(Debug)]
pub enum CommitError {
    /// A step failed and every step was rolled back.
    RolledBack { cause: StorageError },
    /// A step failed and undoing it failed as well. The tree needs a rebuild.
    RollbackFailed {
        cause: StorageError,
        rollback: StorageError,
    },
}

impl CommitError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RolledBack { .. } => ErrorKind::RolledBack,
            Self::RollbackFailed { .. } => ErrorKind::RollbackFailed,
        }
    }
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RolledBack { cause } => write!(f, "write failed and was rolled back: {cause}"),
            Self::RollbackFailed { cause, rollback } => write!(
                f,
                "write failed ({cause}) and rollback failed ({rollback}), tree may be corrupt"
            ),
        }
    }
}

impl std::error::Error for CommitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RolledBack { cause } | Self::RollbackFailed { cause, .. } => Some(cause),
        }
    }
}

type StepFuture<'a> = BoxFuture<'a, Result<(), StorageError>>;

/// An action and the rollback undoing it.
pub struct Step<'a> {
    action: StepFuture<'a>,
    rollback: Box<dyn FnOnce() -> StepFuture<'a> + Send + 'a>,
}

impl<'a> Step<'a> {
    pub fn new(
        action: StepFuture<'a>,
        rollback: impl FnOnce() -> StepFuture<'a> + Send + 'a,
    ) -> Self {
        Self {
            action,
            rollback: Box::new(rollback),
        }
    }
}

/// Runs all steps, rolling every one of them back if any fails.
pub async fn run_steps(steps: Vec<Step<'_>>) -> Result<(), CommitError> {
    let (actions, rollbacks): (Vec<_>, Vec<_>) =
        steps.into_iter().map(|s| (s.action, s.rollback)).unzip();

    let Some(cause) = join_all(actions)
        .await
        .into_iter()
        .find_map(Result::err)
    else {
        return Ok(());
    };

    tracing::warn!("rolling back {} steps after failed write: {}", rollbacks.len(), cause);
    let failed = join_all(rollbacks.into_iter().map(|rollback| rollback()))
        .await
        .into_iter()
        .find_map(Result::err);
    match failed {
        None => Err(CommitError::RolledBack { cause }),
        Some(rollback) => {
            tracing::error!("rollback failed, tree may be corrupt: {}", rollback);
            Err(CommitError::RollbackFailed { cause, rollback })
        }
    }
}

/// Byte writes staged for one atomic commit.
///
/// Overlapping writes are merged, later writes winning, so every byte of the
/// storage is written by at most one step.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    writes: BTreeMap<u64, Vec<u8>>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Staged bytes in write order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.writes.iter().map(|(o, b)| (*o, b.as_slice()))
    }

    /// Stages `bytes` at `offset`.
    pub fn write(&mut self, offset: u64, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut start = offset;
        let mut end = offset + bytes.len() as u64;
        let overlapping: Vec<u64> = self
            .writes
            .range(..end)
            .filter(|(o, b)| **o + b.len() as u64 > start)
            .map(|(o, _)| *o)
            .collect();
        let mut pieces = Vec::with_capacity(overlapping.len());
        for o in overlapping {
            if let Some(b) = self.writes.remove(&o) {
                start = start.min(o);
                end = end.max(o + b.len() as u64);
                pieces.push((o, b));
            }
        }
        let mut merged = vec![0u8; (end - start) as usize];
        let staged = pieces.iter().map(|(o, b)| (*o, b.as_slice()));
        for (o, b) in staged.chain([(offset, bytes.as_slice())]) {
            let at = (o - start) as usize;
            merged[at..at + b.len()].copy_from_slice(b);
        }
        self.writes.insert(start, merged);
    }

    /// Applies all staged writes atomically.
    pub async fn commit<S: ByteStorage>(self, storage: &S) -> Result<(), crate::error::TreeError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let size = storage.len().await?;
        let mut steps = Vec::with_capacity(self.writes.len());
        for (offset, bytes) in self.writes {
            let original = read_padded(storage, offset, bytes.len(), size).await?;
            steps.push(Step::new(storage.write(offset, bytes).boxed(), move || {
                storage.write(offset, original).boxed()
            }));
        }
        run_steps(steps).await?;
        Ok(())
    }
}

/// Reads a range that may extend past the end, zero-filling the missing part.
async fn read_padded<S: ByteStorage>(
    storage: &S,
    offset: u64,
    length: usize,
    size: u64,
) -> Result<Vec<u8>, StorageError> {
    let available = size.saturating_sub(offset).min(length as u64) as usize;
    let mut bytes = if available == 0 {
        Vec::new()
    } else {
        storage.read(offset, available).await?
    };
    bytes.resize(length, 0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::FaultyStorage;

    #[test]
    fn test_batch_merges_overlapping_writes() {
        let mut batch = WriteBatch::new();
        batch.write(10, vec![1; 10]);
        batch.write(30, vec![3; 2]);
        batch.write(15, vec![2; 10]);
        let writes: Vec<_> = batch.iter().map(|(o, b)| (o, b.to_vec())).collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, 10);
        assert_eq!(writes[0].1, [vec![1; 5], vec![2; 10]].concat());
        assert_eq!(writes[1], (30, vec![3; 2]));
    }

    #[test]
    fn test_batch_keeps_adjacent_writes_apart() {
        let mut batch = WriteBatch::new();
        batch.write(0, vec![1; 4]);
        batch.write(4, vec![2; 4]);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_applies_all_writes() {
        let storage = MemoryStorage::from_bytes(vec![0; 16]);
        let mut batch = WriteBatch::new();
        batch.write(0, vec![1, 2]);
        batch.write(20, vec![9]);
        batch.commit(&storage).await.expect("commit");
        let bytes = storage.snapshot().expect("snapshot");
        assert_eq!(&bytes[..2], &[1, 2]);
        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[20], 9);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_all_steps() {
        let storage = FaultyStorage::new(vec![7; 32]);
        storage.fail_nth_write(2);

        let mut batch = WriteBatch::new();
        batch.write(0, vec![1; 4]);
        batch.write(10, vec![2; 4]);
        batch.write(20, vec![3; 4]);
        let err = batch.commit(&storage).await.expect_err("second write fails");
        assert_eq!(err.kind(), ErrorKind::RolledBack);
        assert_eq!(storage.snapshot(), vec![7; 32]);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_reported() {
        let storage = FaultyStorage::new(vec![0; 8]);
        storage.fail_writes_after(1);

        let mut batch = WriteBatch::new();
        batch.write(0, vec![1]);
        batch.write(4, vec![2]);
        let err = batch.commit(&storage).await.expect_err("rollback fails");
        assert_eq!(err.kind(), ErrorKind::RollbackFailed);
    }
}
