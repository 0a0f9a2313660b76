//! Tree locking contract and the default in-process lock manager.
//!
//! Reads take a shared lock and mutations an exclusive lock, both keyed by the
//! caller-assigned tree id. The engine only cooperates with a [`LockManager`];
//! any implementation honouring `lock(id, {shared, timeout}) -> release()` can
//! be plugged in.
//!
//! # Thread Safety
//!
//! [`TreeLockManager`] keeps one `tokio::sync::RwLock` per id. Waiting for a
//! lock is an async suspension point bounded by the requested timeout.
//!
//! # Invariants
//!
//! - Lock entries are never removed once created (for the lifetime of the manager)
//! - An empty id is rejected before any waiting happens

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Errors raised while acquiring a tree lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The tree has no identifier to lock on.
    MissingId,
    /// The lock was not granted in time.
    Timeout { id: String, timeout: Duration },
    /// The lock table was poisoned by a panicking thread.
    Poisoned,
}

impl LockError {
    #[must_use]
    pub const fn kind(&self) -> crate::error::ErrorKind {
        match self {
            Self::MissingId => crate::error::ErrorKind::TreeIdNotSet,
            Self::Timeout { .. } | Self::Poisoned => crate::error::ErrorKind::LockTimeout,
        }
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingId => write!(f, "tree id not set"),
            Self::Timeout { id, timeout } => {
                write!(f, "timed out after {timeout:?} waiting for lock on {id:?}")
            }
            Self::Poisoned => write!(f, "lock table poisoned"),
        }
    }
}

impl std::error::Error for LockError {}

/// How a lock is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub shared: bool,
    pub timeout: Duration,
}

impl LockOptions {
    #[must_use]
    pub const fn shared(timeout: Duration) -> Self {
        Self {
            shared: true,
            timeout,
        }
    }

    #[must_use]
    pub const fn exclusive(timeout: Duration) -> Self {
        Self {
            shared: false,
            timeout,
        }
    }
}

/// A held lock. Dropping it releases the lock as well.
pub trait TreeLock: Send {
    fn release(self);
}

/// Grants shared and exclusive locks keyed by tree id.
pub trait LockManager: Send + Sync {
    type Guard: TreeLock;

    fn lock(
        &self,
        id: &str,
        options: LockOptions,
    ) -> impl Future<Output = Result<Self::Guard, LockError>> + Send;
}

impl<M: LockManager> LockManager for Arc<M> {
    type Guard = M::Guard;

    fn lock(
        &self,
        id: &str,
        options: LockOptions,
    ) -> impl Future<Output = Result<Self::Guard, LockError>> + Send {
        (**self).lock(id, options)
    }
}

/// Guard returned by [`TreeLockManager`].
#[derive(Debug)]
pub enum TreeLockGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl TreeLock for TreeLockGuard {
    fn release(self) {
        drop(self);
    }
}

/// In-process lock manager with one reader/writer lock per tree id.
#[derive(Debug, Default)]
pub struct TreeLockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl TreeLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Result<Arc<RwLock<()>>, LockError> {
        let mut locks = self.locks.lock().map_err(|_| LockError::Poisoned)?;
        Ok(Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        ))
    }
}

impl LockManager for TreeLockManager {
    type Guard = TreeLockGuard;

    async fn lock(&self, id: &str, options: LockOptions) -> Result<TreeLockGuard, LockError> {
        if id.is_empty() {
            return Err(LockError::MissingId);
        }
        let lock = self.entry(id)?;
        let timed_out = || LockError::Timeout {
            id: id.to_string(),
            timeout: options.timeout,
        };
        if options.shared {
            tokio::time::timeout(options.timeout, lock.read_owned())
                .await
                .map(TreeLockGuard::Shared)
                .map_err(|_| timed_out())
        } else {
            tokio::time::timeout(options.timeout, lock.write_owned())
                .await
                .map(TreeLockGuard::Exclusive)
                .map_err(|_| timed_out())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let manager = TreeLockManager::new();
        let a = manager.lock("t", LockOptions::shared(SHORT)).await.expect("a");
        let b = manager.lock("t", LockOptions::shared(SHORT)).await.expect("b");
        a.release();
        b.release();
    }

    #[tokio::test]
    async fn test_exclusive_lock_times_out() {
        let manager = TreeLockManager::new();
        let held = manager
            .lock("t", LockOptions::shared(SHORT))
            .await
            .expect("shared");
        let err = manager
            .lock("t", LockOptions::exclusive(SHORT))
            .await
            .expect_err("exclusive must wait");
        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(err.kind().as_str(), "lock-timeout");

        held.release();
        manager
            .lock("t", LockOptions::exclusive(SHORT))
            .await
            .expect("granted after release");
    }

    #[tokio::test]
    async fn test_ids_are_independent() {
        let manager = TreeLockManager::new();
        let _a = manager
            .lock("a", LockOptions::exclusive(SHORT))
            .await
            .expect("a");
        manager
            .lock("b", LockOptions::exclusive(SHORT))
            .await
            .expect("b");
    }

    #[tokio::test]
    async fn test_missing_id() {
        let manager = TreeLockManager::new();
        let err = manager
            .lock("", LockOptions::exclusive(SHORT))
            .await
            .expect_err("empty id");
        assert_eq!(err, LockError::MissingId);
        assert_eq!(err.kind().as_str(), "tree-id-not-set");
    }
}
