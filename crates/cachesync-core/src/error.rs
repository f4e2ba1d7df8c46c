use thiserror::Error;

/// Core error types for CacheSync operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Time formatting error: {0}")]
    TimeFormat(#[from] time::error::Format),
}

/// Errors produced while decoding an inbound pub/sub payload.
///
/// A payload that is not valid JSON at all is `Malformed`; a payload that
/// parses but matches neither message shape is `Unrecognized`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unrecognized message shape: {0}")]
    Unrecognized(String),
}

impl DecodeError {
    pub fn unrecognized(reason: impl Into<String>) -> Self {
        Self::Unrecognized(reason.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Errors reported by a pub/sub transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport connection error: {0}")]
    Connection(String),

    #[error("failed to subscribe to '{channel}': {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("failed to unsubscribe from '{channel}': {reason}")]
    Unsubscribe { channel: String, reason: String },

    #[error("failed to publish to '{channel}': {reason}")]
    Publish { channel: String, reason: String },

    #[error("transport query failed: {0}")]
    Query(String),

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection(reason.into())
    }

    pub fn subscribe(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsubscribe {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn publish(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn query(reason: impl Into<String>) -> Self {
        Self::Query(reason.into())
    }
}

/// Errors reported by a local cache store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheStoreError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("operation not supported by cache store: {0}")]
    Unsupported(&'static str),
}

impl CacheStoreError {
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }
}
