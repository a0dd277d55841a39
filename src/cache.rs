//! The TTL-aware session cache.
//!
//! Wraps a `KvStore` and owns both the record format (JSON) and the expiry
//! policy. Expiry is lazy: a stale record is only noticed, deleted and replaced
//! by the next request for the same client.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::metrics::{
    CACHE_CORRUPT_RECORDS, CACHE_EXPIRED, CACHE_HITS, CACHE_MISSES, CACHE_WRITE_FAILURES,
};
use crate::store::{KvStore, StoreError};
use crate::upstream::Target;

/// Shard count used when per-key serialization is enabled.
pub const DEFAULT_KEY_LOCK_SHARDS: usize = 64;

/// One sticky routing decision for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub target: Target,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "time")]
    pub assigned_at: u64,
}

impl Assignment {
    pub fn new(target: Target, assigned_at: u64) -> Self {
        Self { target, assigned_at }
    }

    pub fn is_fresh(&self, now: u64, ttl: Duration) -> bool {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        now < self.assigned_at.saturating_add(ttl_ms)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub struct SessionCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    key_locks: Option<Vec<Mutex<()>>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl, key_locks: None }
    }

    /// Serializes `resolve_or_create` per client key across `shards` locks.
    ///
    /// Without this, two concurrent first requests for the same client may
    /// both compute and write an assignment, and the last write wins.
    pub fn with_key_serialization(mut self, shards: usize) -> Self {
        let shards = shards.max(1);
        self.key_locks = Some((0..shards).map(|_| Mutex::new(())).collect());
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn serializes_per_key(&self) -> bool {
        self.key_locks.is_some()
    }

    /// Reads the assignment for `client_key`, fresh or not.
    ///
    /// Unreadable or corrupt records are reported as absent.
    pub fn get(&self, client_key: &str) -> Option<Assignment> {
        let raw = match self.store.get(client_key.as_bytes()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                error!(client = %client_key, error = %e, "Failed to read cached assignment");
                return None;
            }
        };

        match serde_json::from_slice::<Assignment>(&raw) {
            Ok(assignment) => Some(assignment),
            Err(e) => {
                CACHE_CORRUPT_RECORDS.inc();
                warn!(client = %client_key, error = %e, "Discarding corrupt cache record");
                None
            }
        }
    }

    pub fn put(&self, client_key: &str, assignment: &Assignment) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(assignment)
            .map_err(|e| StoreError::Transaction(format!("encode assignment: {}", e)))?;
        self.store.put(client_key.as_bytes(), &encoded)
    }

    pub fn delete(&self, client_key: &str) -> Result<bool, StoreError> {
        self.store.delete(client_key.as_bytes())
    }

    /// Returns the cached target for `client_key`, computing and persisting a
    /// new assignment with `select` when there is none or it has expired.
    pub async fn resolve_or_create<F, Fut>(&self, client_key: &str, select: F) -> Target
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Target>,
    {
        let _guard = match &self.key_locks {
            Some(locks) => Some(locks[shard_for(client_key, locks.len())].lock().await),
            None => None,
        };

        self.resolve_or_create_at(client_key, now_millis, select).await
    }

    async fn resolve_or_create_at<C, F, Fut>(&self, client_key: &str, now: C, select: F) -> Target
    where
        C: Fn() -> u64,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Target>,
    {
        if let Some(existing) = self.get(client_key) {
            if existing.is_fresh(now(), self.ttl) {
                CACHE_HITS.inc();
                debug!(client = %client_key, upstream = %existing.target, "Using cached upstream");
                return existing.target;
            }

            CACHE_EXPIRED.inc();
            debug!(client = %client_key, upstream = %existing.target, "Cached upstream expired");
            if let Err(e) = self.delete(client_key) {
                error!(client = %client_key, error = %e, "Failed to delete expired assignment");
            }
        } else {
            CACHE_MISSES.inc();
        }

        let target = select().await;
        let assignment = Assignment::new(target, now());

        match self.put(client_key, &assignment) {
            Ok(()) => info!(
                client = %client_key,
                upstream = %assignment.target.host,
                assigned_at = assignment.assigned_at,
                "Upstream cached for client"
            ),
            Err(e) => {
                CACHE_WRITE_FAILURES.inc();
                error!(
                    client = %client_key,
                    upstream = %assignment.target.host,
                    error = %e,
                    "Failed to persist assignment, routing without caching"
                );
            }
        }

        assignment.target
    }

    /// Lists cached assignments whose client key starts with `prefix`.
    /// Corrupt records are skipped.
    pub fn scan(&self, prefix: &str) -> Result<Vec<(String, Assignment)>, StoreError> {
        let entries = self.store.scan_prefix(prefix.as_bytes())?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| {
                let key = String::from_utf8(key).ok()?;
                let assignment = serde_json::from_slice::<Assignment>(&value).ok()?;
                Some((key, assignment))
            })
            .collect())
    }
}

fn shard_for(client_key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client_key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
