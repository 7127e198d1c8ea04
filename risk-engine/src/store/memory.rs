//! In-memory record store

use super::{CasOutcome, RecordStore, Versioned};
use crate::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// `DashMap`-backed store for tests and single-node deployments
#[derive(Debug)]
pub struct MemoryStore<T> {
    records: Arc<DashMap<String, Versioned<T>>>,
}

impl<T> MemoryStore<T> {
    /// Create empty store
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

#[async_trait]
impl<T> RecordStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<T>>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, value: T) -> Result<u64> {
        let mut entry = self.records.entry(key.to_string()).or_insert(Versioned {
            version: 0,
            value: value.clone(),
        });
        entry.version += 1;
        entry.value = value;
        Ok(entry.version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: T,
    ) -> Result<CasOutcome<T>> {
        // The entry guard holds the shard lock across compare and write
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().version) {
                    return Ok(CasOutcome::Conflict {
                        current: Some(occupied.get().clone()),
                    });
                }
                let version = occupied.get().version + 1;
                occupied.insert(Versioned { version, value });
                Ok(CasOutcome::Applied { version })
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(CasOutcome::Conflict { current: None });
                }
                vacant.insert(Versioned { version: 1, value });
                Ok(CasOutcome::Applied { version: 1 })
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_versions() {
        let store: MemoryStore<String> = MemoryStore::new();

        let first = store.compare_and_swap("k", None, "a".into()).await.unwrap();
        assert_eq!(first, CasOutcome::Applied { version: 1 });

        // Stale writer loses and sees the current record
        let stale = store.compare_and_swap("k", None, "b".into()).await.unwrap();
        match stale {
            CasOutcome::Conflict { current: Some(current) } => {
                assert_eq!(current.version, 1);
                assert_eq!(current.value, "a");
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let second = store.compare_and_swap("k", Some(1), "c".into()).await.unwrap();
        assert!(second.is_applied());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "c");
    }

    #[tokio::test]
    async fn test_put_and_remove() {
        let store: MemoryStore<u32> = MemoryStore::new();
        assert_eq!(store.put("x", 7).await.unwrap(), 1);
        assert_eq!(store.put("x", 8).await.unwrap(), 2);
        assert_eq!(store.len().await.unwrap(), 1);

        let missing = store.compare_and_swap("y", Some(3), 1).await.unwrap();
        assert_eq!(missing, CasOutcome::Conflict { current: None });

        store.remove("x").await.unwrap();
        assert!(store.get("x").await.unwrap().is_none());
    }
}
