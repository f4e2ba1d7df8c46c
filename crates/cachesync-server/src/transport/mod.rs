//! Pub/sub transports.
//!
//! ## Modes
//!
//! - **Redis disabled**: a private in-memory bus; the instance only ever
//!   invalidates itself
//! - **Redis enabled**: [`RedisTransport`], shared with every other instance
//!
//! A Redis URL that cannot even be parsed falls back to the in-memory bus so
//! the service still starts. An unreachable Redis server does not: the Redis
//! transport keeps reconnecting and `/status` reports `isConnected: false`.

mod redis;

pub use self::redis::RedisTransport;

use std::sync::Arc;

use cachesync_core::{MemoryTransport, PubSubTransport};

use crate::config::RedisConfig;

/// Create the transport described by `config`.
pub async fn create_transport(config: &RedisConfig) -> Arc<dyn PubSubTransport> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-memory pub/sub (single instance only)");
        return Arc::new(MemoryTransport::standalone());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    match RedisTransport::connect(config).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Invalid Redis configuration. Falling back to in-memory pub/sub."
            );
            Arc::new(MemoryTransport::standalone())
        }
    }
}
