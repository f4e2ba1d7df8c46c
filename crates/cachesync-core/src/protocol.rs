//! Wire format for cross-instance cache invalidation.
//!
//! Two message shapes travel over the bus:
//!
//! ```text
//! {"kind":"invalidation","key":"hello","timestamp":1718000000000,"originInstanceId":"api-1"}
//! {"type":"hello","timestamp":"2024-06-10T06:13:20Z"}
//! ```
//!
//! The first is the structured invalidation published by [`encode`]. The second
//! is a generic event whose `type` names the cache key to drop.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{CoreError, DecodeError};

/// Value of the `kind` discriminator for invalidation messages.
pub const INVALIDATION_KIND: &str = "invalidation";

/// Default channel for generic events.
pub const DEFAULT_EVENTS_CHANNEL: &str = "user-events";

/// Default channel for structured invalidation messages.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "cache:invalidate";

/// Identifier of one running instance on the bus.
///
/// Assigned once at startup and never changed; cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(Arc<str>);

impl InstanceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A request to drop `key` from every instance except the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub key: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub origin_instance_id: String,
}

impl InvalidationMessage {
    pub fn new(key: impl Into<String>, origin: &InstanceId) -> Self {
        Self {
            key: key.into(),
            timestamp: unix_millis(OffsetDateTime::now_utc()),
            origin_instance_id: origin.as_str().to_string(),
        }
    }

    /// Whether this message was published by `instance`.
    pub fn is_from(&self, instance: &InstanceId) -> bool {
        self.origin_instance_id == instance.as_str()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let wire = WireInvalidation {
            kind: INVALIDATION_KIND,
            message: self,
        };
        Ok(serde_json::to_vec(&wire)?)
    }
}

#[derive(Serialize)]
struct WireInvalidation<'a> {
    kind: &'static str,
    #[serde(flatten)]
    message: &'a InvalidationMessage,
}

/// A loosely typed event; by convention `type` is the cache key to invalidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericEventMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    /// ISO-8601 timestamp. Older publishers omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl GenericEventMessage {
    pub fn new(event_type: impl Into<String>) -> Result<Self, CoreError> {
        Ok(Self {
            event_type: event_type.into(),
            timestamp: Some(OffsetDateTime::now_utc().format(&Rfc3339)?),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Result of a successful [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Invalidation(InvalidationMessage),
    Event(GenericEventMessage),
}

/// Encode an invalidation for `key` stamped with the current time.
pub fn encode(key: &str, origin: &InstanceId) -> Result<Vec<u8>, CoreError> {
    InvalidationMessage::new(key, origin).to_bytes()
}

/// Decode an inbound payload.
///
/// Parsing happens in two steps: the bytes must first be a JSON document
/// (otherwise [`DecodeError::Malformed`]), then the document is matched against
/// the invalidation shape (`kind == "invalidation"`) and the generic event shape
/// (any object carrying a string `type`).
pub fn decode(payload: &[u8]) -> Result<InboundMessage, DecodeError> {
    let value: Value = serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;

    let Value::Object(ref fields) = value else {
        return Err(DecodeError::unrecognized("payload is not a JSON object"));
    };

    if fields.get("kind").and_then(Value::as_str) == Some(INVALIDATION_KIND) {
        return serde_json::from_value::<InvalidationMessage>(value)
            .map(InboundMessage::Invalidation)
            .map_err(|e| DecodeError::unrecognized(format!("invalid invalidation message: {e}")));
    }

    if fields.contains_key("type") {
        return serde_json::from_value::<GenericEventMessage>(value)
            .map(InboundMessage::Event)
            .map_err(|e| DecodeError::unrecognized(format!("invalid event message: {e}")));
    }

    Err(DecodeError::unrecognized(
        "object has neither kind=invalidation nor a type field",
    ))
}

/// Role a channel plays for this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Events,
    Invalidation,
    Other,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Events => "events",
            ChannelKind::Invalidation => "invalidation",
            ChannelKind::Other => "other",
        }
    }
}

/// Names of the two reserved channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedChannels {
    pub events: String,
    pub invalidation: String,
}

impl ReservedChannels {
    pub fn new(events: impl Into<String>, invalidation: impl Into<String>) -> Self {
        Self {
            events: events.into(),
            invalidation: invalidation.into(),
        }
    }

    pub fn classify(&self, channel: &str) -> ChannelKind {
        if channel == self.invalidation {
            ChannelKind::Invalidation
        } else if channel == self.events {
            ChannelKind::Events
        } else {
            ChannelKind::Other
        }
    }
}

impl Default for ReservedChannels {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_CHANNEL, DEFAULT_INVALIDATION_CHANNEL)
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_produces_wire_shape() {
        let origin = InstanceId::new("X");
        let bytes = encode("hello", &origin).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["kind"], "invalidation");
        assert_eq!(value["key"], "hello");
        assert_eq!(value["originInstanceId"], "X");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_decode_invalidation() {
        let payload =
            br#"{"kind":"invalidation","key":"user:1","timestamp":1718000000000,"originInstanceId":"api-2"}"#;

        match decode(payload).unwrap() {
            InboundMessage::Invalidation(msg) => {
                assert_eq!(msg.key, "user:1");
                assert_eq!(msg.timestamp, 1_718_000_000_000);
                assert!(msg.is_from(&InstanceId::new("api-2")));
                assert!(!msg.is_from(&InstanceId::new("api-1")));
            }
            other => panic!("expected invalidation, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_generic_event() {
        let payload = br#"{"type":"hello","timestamp":"2024-06-10T06:13:20.000Z"}"#;

        match decode(payload).unwrap() {
            InboundMessage::Event(event) => {
                assert_eq!(event.event_type, "hello");
                assert_eq!(event.timestamp.as_deref(), Some("2024-06-10T06:13:20.000Z"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_event_without_timestamp() {
        let decoded = decode(br#"{"type":"hello"}"#).unwrap();
        assert_eq!(
            decoded,
            InboundMessage::Event(GenericEventMessage {
                event_type: "hello".to_string(),
                timestamp: None,
            })
        );
    }

    #[test]
    fn test_kind_takes_precedence_over_type() {
        let payload = br#"{"kind":"invalidation","type":"ignored","key":"k","timestamp":1,"originInstanceId":"o"}"#;
        assert!(matches!(
            decode(payload).unwrap(),
            InboundMessage::Invalidation(_)
        ));
    }

    #[test]
    fn test_malformed_is_distinct_from_unrecognized() {
        assert!(decode(b"not json at all").unwrap_err().is_malformed());
        assert!(decode(b"").unwrap_err().is_malformed());

        let unrecognized = decode(br#"{"hello":"world"}"#).unwrap_err();
        assert!(matches!(unrecognized, DecodeError::Unrecognized(_)));

        let array = decode(b"[1,2,3]").unwrap_err();
        assert!(matches!(array, DecodeError::Unrecognized(_)));
    }

    #[test]
    fn test_invalidation_missing_key_is_unrecognized() {
        let err = decode(br#"{"kind":"invalidation","timestamp":1,"originInstanceId":"a"}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Unrecognized(_)));
    }

    #[test]
    fn test_non_string_type_is_unrecognized() {
        let err = decode(br#"{"type":42}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Unrecognized(_)));
    }

    #[test]
    fn test_generic_event_has_iso_timestamp() {
        let event = GenericEventMessage::new("hello").unwrap();
        let ts = event.timestamp.clone().unwrap();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());

        let value: Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "hello");
    }

    #[test]
    fn test_classify_channels() {
        let channels = ReservedChannels::default();
        assert_eq!(channels.classify("cache:invalidate"), ChannelKind::Invalidation);
        assert_eq!(channels.classify("user-events"), ChannelKind::Events);
        assert_eq!(channels.classify("cache:hit"), ChannelKind::Other);
    }
}
