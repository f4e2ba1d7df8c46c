//! Local cache store and the gateway used to apply invalidations.
//!
//! ## Layers
//!
//! - [`CacheStore`]: whatever actually holds the values (in-process map, a
//!   remote store, ...)
//! - [`LocalCache`]: the in-memory store used by default, a `DashMap` with
//!   per-entry TTL
//! - [`CacheGateway`]: the only entry point used by the invalidation path.
//!   It never propagates anything to other instances and never returns store
//!   errors, it logs them instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CacheStoreError;

/// A key/value store holding this instance's cached values.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheStoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError>;

    /// Remove `key`. Returns whether an entry was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;

    /// Remove every entry. Returns whether the store confirms the clear.
    ///
    /// Stores without a native clear return [`CacheStoreError::Unsupported`].
    async fn clear(&self) -> Result<bool, CacheStoreError>;

    /// Number of live entries, if the store can tell cheaply.
    fn len(&self) -> Option<usize> {
        None
    }
}

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so cache hits hand out a cheap clone.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }

    fn expires_at(&self) -> Instant {
        self.cached_at + self.ttl
    }
}

/// In-process cache bounded to `max_entries`.
///
/// When full, expired entries are purged first; if that frees nothing the
/// entry closest to expiry is evicted.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, CachedEntry>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Drop `key` only if the entry stored now is expired. A writer may have
    /// replaced it since the caller looked.
    fn remove_expired(&self, key: &str) -> bool {
        self.entries.remove_if(key, |_, entry| entry.is_expired()).is_some()
    }

    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }

        self.entries.retain(|_, entry| !entry.is_expired());
        if self.entries.len() < self.max_entries {
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at())
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            tracing::debug!(key = %key, "evicted cache entry to make room");
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl CacheStore for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheStoreError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(Arc::clone(&entry.data)));
            }
        }
        self.remove_expired(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError> {
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self) -> Result<bool, CacheStoreError> {
        self.entries.clear();
        Ok(true)
    }

    fn len(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// Façade over a [`CacheStore`] for the invalidation path.
#[derive(Clone)]
pub struct CacheGateway {
    store: Arc<dyn CacheStore>,
    known_keys: Arc<[String]>,
}

impl CacheGateway {
    /// `known_keys` is what [`CacheGateway::clear`] falls back to deleting
    /// when the store cannot clear itself.
    pub fn new(store: Arc<dyn CacheStore>, known_keys: Vec<String>) -> Self {
        Self {
            store,
            known_keys: known_keys.into(),
        }
    }

    pub fn local(max_entries: usize, known_keys: Vec<String>) -> Self {
        Self::new(Arc::new(LocalCache::new(max_entries)), known_keys)
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache get failed");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if let Err(e) = self.store.set(key, value, ttl).await {
            tracing::warn!(key = %key, error = %e, "cache set failed");
        }
    }

    /// Drop `key` from the local cache.
    pub async fn delete(&self, key: &str) {
        match self.store.delete(key).await {
            Ok(existed) => {
                tracing::debug!(key = %key, existed, "cache key invalidated");
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "failed to invalidate cache key");
            }
        }
    }

    /// Clear the whole local cache.
    ///
    /// Returns `true` only when the store confirms the clear. Otherwise the
    /// known keys are deleted one by one and `false` is returned.
    pub async fn clear(&self) -> bool {
        match self.store.clear().await {
            Ok(true) => {
                tracing::info!("local cache cleared");
                true
            }
            Ok(false) => {
                tracing::warn!("cache store did not confirm clear, deleting known keys");
                self.delete_known_keys(&self.known_keys).await;
                false
            }
            Err(CacheStoreError::Unsupported(op)) => {
                tracing::debug!(operation = op, "cache store has no native clear, deleting known keys");
                self.delete_known_keys(&self.known_keys).await;
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to clear local cache, deleting known keys");
                self.delete_known_keys(&self.known_keys).await;
                false
            }
        }
    }

    /// Delete each of `keys`; a failure on one key does not stop the rest.
    pub async fn delete_known_keys(&self, keys: &[String]) {
        for key in keys {
            self.delete(key).await;
        }
    }

    pub fn len(&self) -> Option<usize> {
        self.store.len()
    }
}

impl std::fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGateway")
            .field("known_keys", &self.known_keys)
            .finish_non_exhaustive()
    }
}
