//! Test utilities: fault-injecting storage and log setup.
//!
//! [`FaultyStorage`] wraps a [`MemoryStorage`] and fails writes on demand,
//! either at a chosen write number or at random from a seeded generator so a
//! failing run can be replayed.

#![allow(clippy::expect_used)]

use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::{ByteStorage, MemoryStorage, StorageError};

/// When writes should start failing.
#[derive(Debug, Default)]
struct FaultPlan {
    /// Writes seen so far, failed ones included.
    writes: u64,
    /// Fail only this write (1-based).
    fail_nth: Option<u64>,
    /// Fail every write after this many succeeded.
    fail_after: Option<u64>,
    /// Random failures as `(rng, rate)`.
    random: Option<(StdRng, f64)>,
}

impl FaultPlan {
    fn next_write_fails(&mut self) -> bool {
        self.writes += 1;
        if self.fail_nth == Some(self.writes) {
            return true;
        }
        if self.fail_after.is_some_and(|n| self.writes > n) {
            return true;
        }
        self.random
            .as_mut()
            .is_some_and(|(rng, rate)| rng.random_bool(*rate))
    }
}

/// In-memory storage whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FaultyStorage {
    inner: MemoryStorage,
    plan: Mutex<FaultPlan>,
}

impl FaultyStorage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: MemoryStorage::from_bytes(bytes),
            plan: Mutex::default(),
        }
    }

    fn plan(&self) -> MutexGuard<'_, FaultPlan> {
        self.plan.lock().expect("fault plan poisoned")
    }

    /// Fails the `n`-th write from now (1-based).
    pub fn fail_nth_write(&self, n: u64) {
        let mut plan = self.plan();
        plan.fail_nth = Some(plan.writes + n);
    }

    /// Lets `n` more writes through, then fails every write.
    pub fn fail_writes_after(&self, n: u64) {
        let mut plan = self.plan();
        plan.fail_after = Some(plan.writes + n);
    }

    /// Fails each write with probability `rate`, reproducibly for `seed`.
    pub fn fail_randomly(&self, seed: u64, rate: f64) {
        self.plan().random = Some((StdRng::seed_from_u64(seed), rate));
    }

    /// Stops injecting faults.
    pub fn heal(&self) {
        let mut plan = self.plan();
        plan.fail_nth = None;
        plan.fail_after = None;
        plan.random = None;
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.snapshot().expect("snapshot")
    }
}

impl ByteStorage for FaultyStorage {
    async fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        self.inner.read(offset, length).await
    }

    async fn write(&self, offset: u64, bytes: Vec<u8>) -> Result<(), StorageError> {
        let fails = self.plan().next_write_fails();
        if fails {
            return Err(StorageError::InjectedFault(format!(
                "write of {} bytes at {offset}",
                bytes.len()
            )));
        }
        self.inner.write(offset, bytes).await
    }

    async fn len(&self) -> Result<u64, StorageError> {
        self.inner.len().await
    }
}

/// Installs a log subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nth_write_fails_once() {
        let storage = FaultyStorage::new(vec![0; 4]);
        storage.fail_nth_write(2);
        storage.write(0, vec![1]).await.expect("first");
        assert!(storage.write(1, vec![1]).await.is_err());
        storage.write(2, vec![1]).await.expect("third");
        assert_eq!(storage.snapshot(), vec![1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_seeded_faults_replay() {
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let storage = FaultyStorage::new(Vec::new());
            storage.fail_randomly(42, 0.5);
            let mut run = Vec::new();
            for i in 0..32 {
                run.push(storage.write(i, vec![1]).await.is_ok());
            }
            outcomes.push(run);
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }
}
