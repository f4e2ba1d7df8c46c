//! Process-local pub/sub bus.
//!
//! Used when Redis is disabled (a single instance still gets a working
//! invalidation path) and by tests, which can connect several instances to one
//! [`MemoryBus`] and drive connection failures by hand.
//!
//! Delivery mirrors Redis: a publication reaches every endpoint subscribed to
//! the channel, the publisher included, and endpoints whose subscriber is not
//! `ready` miss it. Pattern subscriptions get their own copy of a matching
//! publication, so an endpoint holding both a channel and a matching pattern
//! receives it twice and counts twice.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::status::{ConnectionRole, ConnectionStatus};
use crate::transport::{PubSubTransport, StatusBoard, TransportEvent, glob_match};

#[derive(Debug)]
struct Endpoint {
    channels: RwLock<BTreeSet<String>>,
    patterns: RwLock<BTreeSet<String>>,
    board: StatusBoard,
}

impl Endpoint {
    fn is_ready(&self) -> bool {
        self.board.get(ConnectionRole::Subscriber).is_ready()
    }

    fn is_listening(&self, channel: &str) -> bool {
        self.is_ready() && self.channels.read().contains(channel)
    }

    fn matching_patterns(&self, channel: &str) -> Vec<String> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.patterns
            .read()
            .iter()
            .filter(|pattern| glob_match(pattern, channel))
            .cloned()
            .collect()
    }
}

/// Shared in-memory broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    endpoints: Arc<RwLock<Vec<Arc<Endpoint>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new instance to the bus. Both of its connections start `ready`.
    pub fn connect(&self) -> MemoryTransport {
        let endpoint = Arc::new(Endpoint {
            channels: RwLock::new(BTreeSet::new()),
            patterns: RwLock::new(BTreeSet::new()),
            board: StatusBoard::new(ConnectionStatus::Ready),
        });
        self.endpoints.write().push(Arc::clone(&endpoint));

        MemoryTransport {
            bus: self.clone(),
            endpoint,
            failing_subscribes: AtomicUsize::new(0),
            subscribe_calls: Mutex::new(Vec::new()),
        }
    }

    fn deliver(&self, channel: &str, payload: &[u8]) -> u64 {
        let endpoints = self.endpoints.read();
        let mut receivers = 0;
        for endpoint in endpoints.iter() {
            if endpoint.is_listening(channel) {
                endpoint.board.message(channel, payload.to_vec());
                receivers += 1;
            }
            for pattern in endpoint.matching_patterns(channel) {
                endpoint.board.pattern_message(pattern, channel, payload.to_vec());
                receivers += 1;
            }
        }
        receivers
    }

    fn active_channels(&self) -> BTreeSet<String> {
        self.endpoints
            .read()
            .iter()
            .flat_map(|e| e.channels.read().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn count(&self, channel: &str) -> u64 {
        self.endpoints
            .read()
            .iter()
            .filter(|e| e.channels.read().contains(channel))
            .count() as u64
    }

    fn detach(&self, endpoint: &Arc<Endpoint>) {
        self.endpoints.write().retain(|e| !Arc::ptr_eq(e, endpoint));
    }
}

/// One instance's connection pair on a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryTransport {
    bus: MemoryBus,
    endpoint: Arc<Endpoint>,
    failing_subscribes: AtomicUsize,
    subscribe_calls: Mutex<Vec<String>>,
}

impl MemoryTransport {
    /// Standalone transport on a private bus.
    pub fn standalone() -> Self {
        MemoryBus::new().connect()
    }

    /// Force a status transition, as a real connection would report it.
    pub fn set_status(&self, role: ConnectionRole, status: ConnectionStatus) {
        self.endpoint.board.set(role, status);
    }

    pub fn emit_error(&self, role: ConnectionRole, message: impl Into<String>) {
        self.endpoint.board.error(role, message);
    }

    /// Forget every server-side subscription without telling anyone, the way
    /// a broker does when the subscriber connection is replaced.
    pub fn drop_subscriptions(&self) {
        self.endpoint.channels.write().clear();
        self.endpoint.patterns.write().clear();
    }

    /// Drop one server-side subscription silently.
    pub fn drop_subscription(&self, channel: &str) {
        self.endpoint.channels.write().remove(channel);
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Every channel passed to `subscribe`, in call order, including failures.
    pub fn subscribe_calls(&self) -> Vec<String> {
        self.subscribe_calls.lock().clone()
    }

    pub fn clear_subscribe_calls(&self) {
        self.subscribe_calls.lock().clear();
    }

    /// Channels this endpoint is subscribed to on the bus.
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.endpoint.channels.read().clone()
    }

    /// Patterns this endpoint is subscribed to on the bus.
    pub fn pattern_subscriptions(&self) -> BTreeSet<String> {
        self.endpoint.patterns.read().clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, TransportError> {
        if !self.endpoint.board.get(ConnectionRole::Publisher).is_ready() {
            return Err(TransportError::publish(channel, "publisher not ready"));
        }
        Ok(self.bus.deliver(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.subscribe_calls.lock().push(channel.to_string());

        if self.take_injected_failure() {
            return Err(TransportError::subscribe(channel, "injected failure"));
        }
        if !self.endpoint.board.get(ConnectionRole::Subscriber).is_ready() {
            return Err(TransportError::subscribe(channel, "subscriber not ready"));
        }
        self.endpoint.channels.write().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.endpoint.channels.write().remove(channel);
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        if !self.endpoint.is_ready() {
            return Err(TransportError::subscribe(pattern, "subscriber not ready"));
        }
        self.endpoint.patterns.write().insert(pattern.to_string());
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.endpoint.patterns.write().remove(pattern);
        Ok(())
    }

    async fn query_channels(&self, pattern: Option<&str>) -> Result<Vec<String>, TransportError> {
        let pattern = pattern.unwrap_or("*");
        Ok(self
            .bus
            .active_channels()
            .into_iter()
            .filter(|channel| glob_match(pattern, channel))
            .collect())
    }

    async fn subscriber_count(&self, channel: &str) -> Result<u64, TransportError> {
        Ok(self.bus.count(channel))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.endpoint.board.subscribe()
    }

    fn status(&self, role: ConnectionRole) -> ConnectionStatus {
        self.endpoint.board.get(role)
    }

    async fn close(&self) {
        self.endpoint.channels.write().clear();
        self.endpoint.patterns.write().clear();
        self.bus.detach(&self.endpoint);
        self.endpoint
            .board
            .set(ConnectionRole::Publisher, ConnectionStatus::Ended);
        self.endpoint
            .board
            .set(ConnectionRole::Subscriber, ConnectionStatus::Ended);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_including_publisher() {
        let bus = MemoryBus::new();
        let a = bus.connect();
        let b = bus.connect();
        let mut a_events = a.events();
        let mut b_events = b.events();

        a.subscribe("cache:invalidate").await.unwrap();
        b.subscribe("cache:invalidate").await.unwrap();

        let receivers = a.publish("cache:invalidate", b"k").await.unwrap();
        assert_eq!(receivers, 2);

        let expected = TransportEvent::Message {
            channel: "cache:invalidate".to_string(),
            payload: b"k".to_vec(),
        };
        assert_eq!(a_events.recv().await.unwrap(), expected);
        assert_eq!(b_events.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_misses_messages() {
        let bus = MemoryBus::new();
        let a = bus.connect();
        let b = bus.connect();
        b.subscribe("ch").await.unwrap();
        b.set_status(ConnectionRole::Subscriber, ConnectionStatus::Closed);

        assert_eq!(a.publish("ch", b"x").await.unwrap(), 0);
        assert!(b.subscribe("other").await.is_err());
    }

    #[tokio::test]
    async fn test_query_channels_and_counts() {
        let bus = MemoryBus::new();
        let a = bus.connect();
        let b = bus.connect();
        a.subscribe("user:1").await.unwrap();
        b.subscribe("user:1").await.unwrap();
        b.subscribe("cache:hit").await.unwrap();

        assert_eq!(a.query_channels(None).await.unwrap(), vec!["cache:hit", "user:1"]);
        assert_eq!(a.query_channels(Some("user:*")).await.unwrap(), vec!["user:1"]);
        assert_eq!(a.subscriber_count("user:1").await.unwrap(), 2);
        assert_eq!(a.subscriber_count("nobody").await.unwrap(), 0);

        b.close().await;
        assert_eq!(a.subscriber_count("user:1").await.unwrap(), 1);
        assert_eq!(b.status(ConnectionRole::Subscriber), ConnectionStatus::Ended);
    }

    #[tokio::test]
    async fn test_pattern_subscription_delivery() {
        let bus = MemoryBus::new();
        let a = bus.connect();
        let b = bus.connect();
        let mut b_events = b.events();
        b.psubscribe("user:*").await.unwrap();

        assert_eq!(a.publish("user:42", b"signed in").await.unwrap(), 1);
        assert_eq!(a.publish("cache:hit", b"ignored").await.unwrap(), 0);
        assert_eq!(
            b_events.recv().await.unwrap(),
            TransportEvent::PatternMessage {
                pattern: "user:*".to_string(),
                channel: "user:42".to_string(),
                payload: b"signed in".to_vec(),
            }
        );

        // Patterns are not channels.
        assert!(a.query_channels(None).await.unwrap().is_empty());

        b.punsubscribe("user:*").await.unwrap();
        assert_eq!(a.publish("user:42", b"again").await.unwrap(), 0);
        assert!(b.pattern_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_include_patterns() {
        let transport = MemoryTransport::standalone();
        transport.subscribe("cache:invalidate").await.unwrap();
        transport.psubscribe("user:*").await.unwrap();

        transport.drop_subscriptions();
        assert!(transport.subscriptions().is_empty());
        assert!(transport.pattern_subscriptions().is_empty());

        transport.set_status(ConnectionRole::Subscriber, ConnectionStatus::Reconnecting);
        assert!(transport.psubscribe("user:*").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_subscribe_failures() {
        let transport = MemoryTransport::standalone();
        transport.fail_next_subscribes(1);

        assert!(transport.subscribe("a").await.is_err());
        assert!(transport.subscribe("a").await.is_ok());
        assert_eq!(transport.subscribe_calls(), vec!["a", "a"]);
        assert_eq!(transport.subscriptions(), BTreeSet::from(["a".to_string()]));
    }
}
