//! Wiring of the invalidation subsystem for one process.
//!
//! ```text
//!                  ┌──────────────── transport events ────────────────┐
//!                  ▼                                                  │
//!          EventDispatcher ──status/error──► ConnectionMonitor ──► RecoveryController
//!                  │                                ▲                  │
//!               message                             │                  ▼
//!                  ▼                          HealthScheduler     resubscribe + clear
//!            MessageRouter ──► CacheGateway ◄──────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use cachesync_core::{
    CacheGateway, GenericEventMessage, InstanceId, PubSubTransport, ReservedChannels, SubscriptionRegistry,
    encode,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::dispatcher::EventDispatcher;
use crate::metrics;
use crate::monitor::ConnectionMonitor;
use crate::recovery::{RecoveryController, RecoveryPolicy};
use crate::router::MessageRouter;
use crate::scheduler::HealthScheduler;

/// Cache key used by the demo endpoints.
pub const HELLO_KEY: &str = "hello";
const HELLO_VALUE: &str = "Hello World!";

/// Answer to `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub is_connected: bool,
    pub subscribed_channels: Vec<String>,
}

pub struct CacheSyncService {
    instance_id: InstanceId,
    channels: ReservedChannels,
    initial_channels: Vec<String>,
    initial_patterns: Vec<String>,
    hit_channel: String,
    miss_channel: String,
    default_ttl: Duration,
    transport: Arc<dyn PubSubTransport>,
    registry: Arc<SubscriptionRegistry>,
    cache: CacheGateway,
    monitor: Arc<ConnectionMonitor>,
    router: Arc<MessageRouter>,
    scheduler: Arc<HealthScheduler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheSyncService {
    pub fn new(config: &AppConfig, transport: Arc<dyn PubSubTransport>) -> Self {
        let cache = CacheGateway::local(config.cache.max_entries, config.pubsub.known_keys.clone());
        Self::with_cache(config, transport, cache)
    }

    /// Build the service on top of an existing cache gateway.
    pub fn with_cache(config: &AppConfig, transport: Arc<dyn PubSubTransport>, cache: CacheGateway) -> Self {
        let pubsub = &config.pubsub;
        let instance_id = InstanceId::new(pubsub.resolve_instance_id());
        let channels = pubsub.reserved_channels();
        let registry = Arc::new(SubscriptionRegistry::new());
        let shutdown = CancellationToken::new();

        let recovery = RecoveryController::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            cache.clone(),
            RecoveryPolicy {
                debounce: pubsub.recovery_debounce(),
                backoff: pubsub.backoff_policy(),
            },
            shutdown.child_token(),
        );
        let monitor = Arc::new(ConnectionMonitor::new(Arc::clone(&transport), recovery));
        let router = Arc::new(MessageRouter::new(
            instance_id.clone(),
            channels.clone(),
            cache.clone(),
        ));
        let scheduler = Arc::new(HealthScheduler::new(
            Arc::clone(&monitor),
            Arc::clone(&registry),
            pubsub.health_check_interval(),
        ));

        Self {
            instance_id,
            channels,
            initial_channels: pubsub.initial_channels.clone(),
            initial_patterns: pubsub.initial_patterns.clone(),
            hit_channel: pubsub.cache_hit_channel.clone(),
            miss_channel: pubsub.cache_miss_channel.clone(),
            default_ttl: config.cache.default_ttl(),
            transport,
            registry,
            cache,
            monitor,
            router,
            scheduler,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn channels(&self) -> &ReservedChannels {
        &self.channels
    }

    pub fn cache(&self) -> &CacheGateway {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<HealthScheduler> {
        &self.scheduler
    }

    pub fn is_healthy(&self) -> bool {
        self.monitor.is_healthy()
    }

    /// Start the dispatcher, subscribe the initial channels and patterns and
    /// start the health scheduler.
    pub async fn start(&self) {
        // Take the receiver before anything can emit, so no event is missed.
        let events = self.transport.events();
        self.monitor.sync_from_transport();

        let dispatcher = EventDispatcher::new(
            Arc::clone(&self.monitor),
            Arc::clone(&self.router),
            self.cache.clone(),
        );
        let dispatcher = dispatcher.spawn(events, self.shutdown.child_token());

        for channel in &self.initial_channels {
            self.subscribe(channel).await;
        }
        for pattern in &self.initial_patterns {
            self.psubscribe(pattern).await;
        }

        let scheduler = Arc::clone(&self.scheduler).start(self.shutdown.child_token());
        self.tasks.lock().extend([dispatcher, scheduler]);

        info!(
            instance_id = %self.instance_id,
            transport = self.transport.name(),
            channels = ?self.registry.desired(),
            patterns = ?self.registry.patterns(),
            "cache invalidation service started"
        );
    }

    /// Stop background work, drop subscriptions and close the transport.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        // Cancel first: the transport reports `ended` on close and that must
        // not start a recovery.
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed during shutdown");
            }
        }

        for channel in self.registry.desired() {
            if let Err(e) = self.transport.unsubscribe(&channel).await {
                debug!(channel = %channel, error = %e, "unsubscribe during shutdown failed");
            }
        }
        for pattern in self.registry.patterns() {
            if let Err(e) = self.transport.punsubscribe(&pattern).await {
                debug!(pattern = %pattern, error = %e, "punsubscribe during shutdown failed");
            }
        }
        self.transport.close().await;
        metrics::set_connected(false);
        info!(instance_id = %self.instance_id, "cache invalidation service stopped");
    }

    /// Publish a raw payload. Returns the number of receivers, 0 on failure.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> u64 {
        match self.transport.publish(channel, payload).await {
            Ok(receivers) => {
                metrics::record_published(channel, true);
                debug!(channel = %channel, receivers, "published");
                receivers
            }
            Err(e) => {
                metrics::record_published(channel, false);
                warn!(channel = %channel, error = %e, "publish failed");
                0
            }
        }
    }

    /// Add `channel` to the desired set and subscribe to it.
    ///
    /// A transport failure is logged; the channel stays desired and the next
    /// recovery or health check restores it. Returns whether the subscription
    /// is active now.
    pub async fn subscribe(&self, channel: &str) -> bool {
        self.registry.add(channel);
        match self.transport.subscribe(channel).await {
            Ok(()) => {
                debug!(channel = %channel, "subscribed");
                true
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "subscribe failed, left to recovery");
                false
            }
        }
    }

    pub async fn unsubscribe(&self, channel: &str) {
        self.registry.remove(channel);
        if let Err(e) = self.transport.unsubscribe(channel).await {
            warn!(channel = %channel, error = %e, "unsubscribe failed");
        }
    }

    /// Add `pattern` to the desired patterns and subscribe to it. Matching
    /// messages are logged, not applied to the cache.
    pub async fn psubscribe(&self, pattern: &str) -> bool {
        self.registry.add_pattern(pattern);
        match self.transport.psubscribe(pattern).await {
            Ok(()) => {
                debug!(pattern = %pattern, "pattern subscribed");
                true
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "psubscribe failed, left to recovery");
                false
            }
        }
    }

    pub async fn punsubscribe(&self, pattern: &str) {
        self.registry.remove_pattern(pattern);
        if let Err(e) = self.transport.punsubscribe(pattern).await {
            warn!(pattern = %pattern, error = %e, "punsubscribe failed");
        }
    }

    /// Tell other instances to drop `key`.
    pub async fn publish_invalidation(&self, key: &str) -> u64 {
        match encode(key, &self.instance_id) {
            Ok(payload) => self.publish(&self.channels.invalidation, &payload).await,
            Err(e) => {
                error!(key = %key, error = %e, "failed to encode invalidation");
                0
            }
        }
    }

    /// Drop `key` locally, then tell every other instance.
    pub async fn invalidate(&self, key: &str) -> u64 {
        self.cache.delete(key).await;
        metrics::record_invalidation("local");
        self.publish_invalidation(key).await
    }

    /// Publish a generic event; receivers drop the key named by `event_type`.
    pub async fn publish_event(&self, event_type: &str) -> u64 {
        let payload = match GenericEventMessage::new(event_type).and_then(|event| event.to_bytes()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "failed to encode event");
                return 0;
            }
        };
        self.publish(&self.channels.events, &payload).await
    }

    pub async fn subscriber_count(&self, channel: &str) -> u64 {
        match self.transport.subscriber_count(channel).await {
            Ok(count) => count,
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to count subscribers");
                0
            }
        }
    }

    /// Active channels on the transport, optionally filtered by a glob.
    pub async fn channels_matching(&self, pattern: Option<&str>) -> Vec<String> {
        match self.transport.query_channels(pattern).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "failed to list channels");
                Vec::new()
            }
        }
    }

    pub fn get_cache_status(&self) -> CacheStatus {
        CacheStatus {
            is_connected: self.monitor.is_healthy(),
            subscribed_channels: self.registry.desired().into_iter().collect(),
        }
    }

    /// Read the demo key. On a miss the value is stored for next time and
    /// `None` is returned. Either way the outcome is announced on the
    /// hit/miss channel.
    pub async fn get_hello(&self) -> Option<String> {
        if let Some(value) = self.cache.get(HELLO_KEY).await {
            let message = format!("Cache hit for key: {HELLO_KEY}");
            self.publish(&self.hit_channel, message.as_bytes()).await;
            return Some(String::from_utf8_lossy(&value).into_owned());
        }
        self.cache
            .set(HELLO_KEY, HELLO_VALUE.as_bytes().to_vec(), self.default_ttl)
            .await;
        let message = format!("Cache miss for key: {HELLO_KEY}, stored new value");
        self.publish(&self.miss_channel, message.as_bytes()).await;
        None
    }

    /// Ask every instance, this one included, to drop the demo key.
    pub async fn delete_hello(&self) -> u64 {
        self.publish_event(HELLO_KEY).await
    }
}

impl Drop for CacheSyncService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
