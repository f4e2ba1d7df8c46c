//! Building blocks for cross-instance cache invalidation over pub/sub.
//!
//! This crate has no network code. It defines the wire protocol, the
//! subscription registry, the connection status state machine, the local cache
//! gateway and the transport trait; `cachesync-server` plugs Redis into them.

pub mod backoff;
pub mod cache;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use cache::{CacheGateway, CacheStore, CachedEntry, LocalCache};
pub use error::{CacheStoreError, CoreError, DecodeError, TransportError};
pub use memory::{MemoryBus, MemoryTransport};
pub use protocol::{
    ChannelKind, GenericEventMessage, InboundMessage, InstanceId, InvalidationMessage,
    ReservedChannels, decode, encode,
};
pub use registry::SubscriptionRegistry;
pub use status::{AtomicStatus, ConnectionRole, ConnectionStatus};
pub use transport::{PubSubTransport, StatusBoard, TransportEvent};
