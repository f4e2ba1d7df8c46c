//! Redis pub/sub cache invalidation service.
//!
//! Each instance keeps a local cache and listens on two reserved channels.
//! Invalidations published by one instance reach every other instance; lost
//! connections and dropped subscriptions are repaired in the background.

pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod metrics;
pub mod monitor;
pub mod observability;
pub mod recovery;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod transport;

pub use config::AppConfig;
pub use monitor::ConnectionMonitor;
pub use recovery::{RecoveryController, RecoveryError, RecoveryOutcome, RecoveryPolicy, RecoveryScope};
pub use router::{MessageRouter, RouteOutcome};
pub use scheduler::{HealthCheck, HealthScheduler};
pub use server::{CacheSyncServer, build_app};
pub use service::{CacheStatus, CacheSyncService};
