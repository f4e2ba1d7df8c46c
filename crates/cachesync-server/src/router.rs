//! Inbound message classification and dispatch.

use cachesync_core::{CacheGateway, ChannelKind, DecodeError, InboundMessage, InstanceId, ReservedChannels, decode};
use tracing::{debug, info, warn};

use crate::metrics;

/// What the router did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// `key` was deleted from the local cache.
    Invalidated { key: String },
    /// Our own invalidation came back; nothing was touched.
    Suppressed,
    /// Undecodable payload; the local cache was cleared.
    Cleared,
    /// Unknown channel or unrecognized message shape.
    Ignored,
}

impl RouteOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Invalidated { .. } => "applied",
            RouteOutcome::Suppressed => "suppressed",
            RouteOutcome::Cleared => "cleared",
            RouteOutcome::Ignored => "ignored",
        }
    }
}

pub struct MessageRouter {
    instance_id: InstanceId,
    channels: ReservedChannels,
    cache: CacheGateway,
}

impl MessageRouter {
    pub fn new(instance_id: InstanceId, channels: ReservedChannels, cache: CacheGateway) -> Self {
        Self {
            instance_id,
            channels,
            cache,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn channels(&self) -> &ReservedChannels {
        &self.channels
    }

    pub async fn on_message(&self, channel: &str, payload: &[u8]) -> RouteOutcome {
        let kind = self.channels.classify(channel);
        let outcome = match kind {
            ChannelKind::Other => {
                info!(
                    channel = %channel,
                    payload = %String::from_utf8_lossy(payload),
                    "message on unhandled channel"
                );
                RouteOutcome::Ignored
            }
            ChannelKind::Events | ChannelKind::Invalidation => self.route(channel, payload).await,
        };
        metrics::record_message(kind.as_str(), outcome.as_str());
        outcome
    }

    /// Pattern deliveries are logged only. A reserved channel reaches this
    /// instance through its direct subscription, so decoding here would apply
    /// the same invalidation twice.
    pub async fn on_pattern_message(&self, pattern: &str, channel: &str, payload: &[u8]) -> RouteOutcome {
        info!(
            pattern = %pattern,
            channel = %channel,
            payload = %String::from_utf8_lossy(payload),
            "pattern message"
        );
        metrics::record_message("pattern", RouteOutcome::Ignored.as_str());
        RouteOutcome::Ignored
    }

    async fn route(&self, channel: &str, payload: &[u8]) -> RouteOutcome {
        match decode(payload) {
            Ok(InboundMessage::Invalidation(message)) => {
                if message.is_from(&self.instance_id) {
                    debug!(key = %message.key, "ignoring own invalidation");
                    return RouteOutcome::Suppressed;
                }
                debug!(
                    channel = %channel,
                    key = %message.key,
                    origin = %message.origin_instance_id,
                    "invalidation received"
                );
                self.cache.delete(&message.key).await;
                metrics::record_invalidation("invalidation");
                RouteOutcome::Invalidated { key: message.key }
            }
            Ok(InboundMessage::Event(event)) => {
                debug!(channel = %channel, event_type = %event.event_type, "event received");
                self.cache.delete(&event.event_type).await;
                metrics::record_invalidation("event");
                RouteOutcome::Invalidated {
                    key: event.event_type,
                }
            }
            Err(DecodeError::Malformed(e)) => {
                // Whatever key this was meant for is unknown, so drop everything.
                warn!(channel = %channel, error = %e, "malformed message, clearing local cache");
                self.cache.clear().await;
                metrics::record_defensive_clear("malformed");
                RouteOutcome::Cleared
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "unrecognized message ignored");
                RouteOutcome::Ignored
            }
        }
    }
}
