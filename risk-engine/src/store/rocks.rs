//! Durable record store on RocksDB
//!
//! # Column Families
//!
//! - `profiles` - behavior profiles (key: customer id)
//! - `fingerprints` - device fingerprints (key: fingerprint hash)
//!
//! Values are bincode-encoded [`Versioned`] records.

use super::{CasOutcome, RecordStore, Versioned};
use crate::device::DeviceFingerprint;
use crate::profile::BehaviorProfile;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

const CF_PROFILES: &str = "profiles";
const CF_FINGERPRINTS: &str = "fingerprints";

/// Shared RocksDB handle
#[derive(Clone)]
pub struct RocksBackend {
    db: Arc<DB>,
    // Serializes read-compare-write for CAS
    write_lock: Arc<Mutex<()>>,
}

impl RocksBackend {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PROFILES, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_FINGERPRINTS, Self::cf_options()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!("Opened risk store at {:?}", path);

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf_options() -> Options {
        let mut opts = Options::default();
        // Point lookups dominate
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    /// Store for behavior profiles
    pub fn profiles(&self) -> RocksStore<BehaviorProfile> {
        RocksStore::new(self.clone(), CF_PROFILES)
    }

    /// Store for device fingerprints
    pub fn fingerprints(&self) -> RocksStore<DeviceFingerprint> {
        RocksStore::new(self.clone(), CF_FINGERPRINTS)
    }
}

/// Typed view over one column family
pub struct RocksStore<T> {
    backend: RocksBackend,
    cf: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RocksStore<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            cf: self.cf,
            _marker: PhantomData,
        }
    }
}

impl<T> RocksStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn new(backend: RocksBackend, cf: &'static str) -> Self {
        Self {
            backend,
            cf,
            _marker: PhantomData,
        }
    }

    fn cf(&self) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.backend
            .db
            .cf_handle(self.cf)
            .ok_or_else(|| Error::Store(format!("Column family {} not found", self.cf)))
    }

    fn read(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let cf = self.cf()?;
        match self.backend.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, record: &Versioned<T>) -> Result<()> {
        let cf = self.cf()?;
        let bytes = bincode::serialize(record)?;
        self.backend.db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn put_blocking(&self, key: &str, value: T) -> Result<u64> {
        let _guard = self.backend.write_lock.lock();
        let version = self.read(key)?.map(|r| r.version).unwrap_or(0) + 1;
        self.write(key, &Versioned { version, value })?;
        Ok(version)
    }

    fn compare_and_swap_blocking(
        &self,
        key: &str,
        expected: Option<u64>,
        value: T,
    ) -> Result<CasOutcome<T>> {
        let _guard = self.backend.write_lock.lock();
        let current = self.read(key)?;
        if current.as_ref().map(|r| r.version) != expected {
            return Ok(CasOutcome::Conflict { current });
        }
        let version = expected.unwrap_or(0) + 1;
        self.write(key, &Versioned { version, value })?;
        Ok(CasOutcome::Applied { version })
    }

    fn count_blocking(&self) -> Result<usize> {
        let cf = self.cf()?;
        let mut count = 0;
        for item in self.backend.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

/// Run a RocksDB call that may wait on the write lock or scan, off the async workers
async fn blocking<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?
}

#[async_trait]
impl<T> RecordStore<T> for RocksStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<T>>> {
        // Point reads are served inline
        self.read(key)
    }

    async fn put(&self, key: &str, value: T) -> Result<u64> {
        let store = self.clone();
        let key = key.to_string();
        blocking(move || store.put_blocking(&key, value)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: T,
    ) -> Result<CasOutcome<T>> {
        let store = self.clone();
        let key = key.to_string();
        blocking(move || store.compare_and_swap_blocking(&key, expected, value)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let cf = self.cf()?;
        let _guard = self.backend.write_lock.lock();
        self.backend.db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let store = self.clone();
        blocking(move || store.count_blocking()).await
    }
}
