//! Pub/sub transport abstraction.
//!
//! A transport owns two connections, a publisher and a subscriber, and
//! reports everything that happens to them on a single broadcast stream of
//! [`TransportEvent`]s: status transitions, connection errors and inbound
//! messages. Consumers read that stream from one dispatcher task, so events are
//! observed in the order the transport produced them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::status::{AtomicStatus, ConnectionRole, ConnectionStatus};

/// Default buffer size for the event channel.
/// Receivers that fall further behind than this miss events.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Something that happened on a transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status {
        role: ConnectionRole,
        status: ConnectionStatus,
    },
    Error {
        role: ConnectionRole,
        message: String,
    },
    Message {
        channel: String,
        payload: Vec<u8>,
    },
    /// Delivered through a pattern subscription; `pattern` is the glob that
    /// matched `channel`.
    PatternMessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
}

#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Short name used in logs ("redis", "memory").
    fn name(&self) -> &'static str;

    /// Publish `payload` on `channel`. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, TransportError>;

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Subscribe to every channel matching the glob `pattern`.
    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// Channels with at least one subscriber, optionally filtered by a glob
    /// pattern (`*` when `None`).
    async fn query_channels(&self, pattern: Option<&str>) -> Result<Vec<String>, TransportError>;

    async fn subscriber_count(&self, channel: &str) -> Result<u64, TransportError>;

    /// New receiver for the event stream.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Current status of one of the two connections.
    fn status(&self, role: ConnectionRole) -> ConnectionStatus;

    /// Close both connections. The subscriber reports `ended`.
    async fn close(&self);
}

/// Status cells for both connections plus the event sender.
///
/// Transports update status through [`StatusBoard::set`] so the stored value
/// and the emitted event never disagree.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<StatusBoardInner>,
}

#[derive(Debug)]
struct StatusBoardInner {
    publisher: AtomicStatus,
    subscriber: AtomicStatus,
    sender: broadcast::Sender<TransportEvent>,
}

impl StatusBoard {
    pub fn new(initial: ConnectionStatus) -> Self {
        Self::with_capacity(initial, DEFAULT_EVENT_BUFFER)
    }

    pub fn with_capacity(initial: ConnectionStatus, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(StatusBoardInner {
                publisher: AtomicStatus::new(initial),
                subscriber: AtomicStatus::new(initial),
                sender,
            }),
        }
    }

    fn cell(&self, role: ConnectionRole) -> &AtomicStatus {
        match role {
            ConnectionRole::Publisher => &self.inner.publisher,
            ConnectionRole::Subscriber => &self.inner.subscriber,
        }
    }

    pub fn get(&self, role: ConnectionRole) -> ConnectionStatus {
        self.cell(role).load()
    }

    /// Record `status` and emit it. Returns the previous status.
    pub fn set(&self, role: ConnectionRole, status: ConnectionStatus) -> ConnectionStatus {
        let previous = self.cell(role).swap(status);
        if previous != status {
            tracing::debug!(role = %role, from = %previous, to = %status, "transport status changed");
        }
        self.emit(TransportEvent::Status { role, status });
        previous
    }

    pub fn error(&self, role: ConnectionRole, message: impl Into<String>) {
        self.emit(TransportEvent::Error {
            role,
            message: message.into(),
        });
    }

    pub fn message(&self, channel: impl Into<String>, payload: Vec<u8>) {
        self.emit(TransportEvent::Message {
            channel: channel.into(),
            payload,
        });
    }

    pub fn pattern_message(&self, pattern: impl Into<String>, channel: impl Into<String>, payload: Vec<u8>) {
        self.emit(TransportEvent::PatternMessage {
            pattern: pattern.into(),
            channel: channel.into(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.sender.subscribe()
    }

    fn emit(&self, event: TransportEvent) {
        // No receivers is fine: nobody is dispatching yet.
        let _ = self.inner.sender.send(event);
    }
}

/// Redis-style glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, c));
            p += 1;
        } else if let Some((star_p, star_c)) = star {
            p = star_p + 1;
            c = star_c + 1;
            star = Some((star_p, star_c + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}
