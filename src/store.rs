//! Persistent key-value storage for session assignments.
//!
//! The `KvStore` trait is the only surface the session cache sees: opaque
//! byte keys and values with get/put/delete and a prefix scan. `LmdbStore`
//! backs it with an LMDB environment (via `heed`) so assignments survive
//! restarts; `MemoryStore` keeps everything in process.
//!
//! Every operation runs in its own LMDB transaction. Writes are last-write-wins.

use std::collections::BTreeMap;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

/// Name of the LMDB database holding assignment records.
const UPSTREAMS_DB: &str = "upstreams";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transactional byte-oriented key-value storage.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Removes `key`. Returns whether a value was present.
    fn delete(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Returns every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// LMDB-backed store.
pub struct LmdbStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbStore {
    /// Opens (or creates) the store at `path`, which is a directory.
    ///
    /// `map_size_mb` bounds the size of the memory map and therefore of the
    /// database file.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process and
        // the memory map is never handed out beyond heed's transaction guards.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb.max(1) * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| StoreError::Open(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(|e| StoreError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(UPSTREAMS_DB))
            .map_err(|e| StoreError::Open(e.to_string()))?;
        wtxn.commit().map_err(|e| StoreError::Transaction(e.to_string()))?;

        info!(path = %path.as_ref().display(), map_size_mb, "Opened assignment store");
        Ok(Self { env, db })
    }
}

impl KvStore for LmdbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| StoreError::Transaction(e.to_string()))?;
        let value = self
            .db
            .get(&rtxn, key)
            .map_err(|e| StoreError::Transaction(e.to_string()))?
            .map(|v| v.to_vec());
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.db.put(&mut wtxn, key, value).map_err(|e| StoreError::Transaction(e.to_string()))?;
        wtxn.commit().map_err(|e| StoreError::Transaction(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| StoreError::Transaction(e.to_string()))?;
        let deleted =
            self.db.delete(&mut wtxn, key).map_err(|e| StoreError::Transaction(e.to_string()))?;
        wtxn.commit().map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(deleted)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| StoreError::Transaction(e.to_string()))?;
        let iter = self
            .db
            .prefix_iter(&rtxn, prefix)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let mut entries = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| StoreError::Transaction(e.to_string()))?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }
}

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
