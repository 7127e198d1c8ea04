//! Storage interface for profiles and device fingerprints
//!
//! Records are versioned. Writers that must not lose concurrent updates go
//! through [`RecordStore::compare_and_swap`]; within one process they also
//! serialize on [`KeyedLocks`] so CAS conflicts only occur across instances.

pub mod memory;
#[cfg(feature = "rocksdb-store")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-store")]
pub use rocks::{RocksBackend, RocksStore};

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Stored value with its write version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Starts at 1, incremented by every write
    pub version: u64,
    /// Stored value
    pub value: T,
}

/// Outcome of a compare-and-swap
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// Written with this new version
    Applied {
        /// New version
        version: u64,
    },
    /// Current version did not match; nothing written
    Conflict {
        /// What is stored now
        current: Option<Versioned<T>>,
    },
}

impl<T> CasOutcome<T> {
    /// Whether the write went through
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// Durable key-value store with point reads and compare-and-swap
#[async_trait]
pub trait RecordStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Point read
    async fn get(&self, key: &str) -> Result<Option<Versioned<T>>>;

    /// Unconditional write, returns the new version
    async fn put(&self, key: &str, value: T) -> Result<u64>;

    /// Write only if the stored version equals `expected` (`None` = absent)
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: T,
    ) -> Result<CasOutcome<T>>;

    /// Delete (retention only)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Number of stored records
    async fn len(&self) -> Result<usize>;
}

/// Per-key async mutual exclusion
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    /// Number of lock entries
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
