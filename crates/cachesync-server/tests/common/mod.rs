//! Shared fixtures: service instances wired to an in-memory bus.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cachesync_core::{CacheGateway, CacheStore, CacheStoreError, LocalCache, MemoryBus, MemoryTransport};
use cachesync_server::{AppConfig, CacheSyncService};

pub const TTL: Duration = Duration::from_secs(60);

/// Local cache that counts deletes and clears.
#[derive(Default)]
pub struct CountingStore {
    inner: LocalCache,
    deletes: AtomicUsize,
    clears: AtomicUsize,
}

impl CountingStore {
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheStoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<bool, CacheStoreError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear().await
    }

    fn len(&self) -> Option<usize> {
        self.inner.len()
    }
}

pub struct Instance {
    pub service: Arc<CacheSyncService>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<CountingStore>,
}

/// Config for a test instance: fixed id, no Redis, a scheduler that stays
/// out of the way unless a test drives it.
pub fn config(instance_id: &str, channels: &[&str]) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.enabled = false;
    cfg.pubsub.instance_id = Some(instance_id.to_string());
    cfg.pubsub.health_check_interval_ms = 600_000;
    if !channels.is_empty() {
        cfg.pubsub.initial_channels = channels.iter().map(|c| c.to_string()).collect();
    }
    cfg
}

pub fn instance(bus: &MemoryBus, cfg: &AppConfig) -> Instance {
    let transport = Arc::new(bus.connect());
    let store = Arc::new(CountingStore::default());
    let cache = CacheGateway::new(store.clone(), cfg.pubsub.known_keys.clone());
    let service = Arc::new(CacheSyncService::with_cache(cfg, transport.clone(), cache));
    Instance {
        service,
        transport,
        store,
    }
}

pub async fn started(bus: &MemoryBus, instance_id: &str) -> Instance {
    let instance = instance(bus, &config(instance_id, &[]));
    instance.service.start().await;
    instance
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
