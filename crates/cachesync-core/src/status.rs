//! Connection status state machine shared by every transport.
//!
//! ```text
//!              ┌───────────── error/close ─────────────┐
//!              ▼                                       │
//! Connecting ──► Ready ──► Closed ──► Reconnecting ──► Connecting
//!     │            │         │              │
//!     └────────────┴─────────┴──────────────┴──────► Ended (terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Status of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    Connecting = 0,
    Ready = 1,
    Reconnecting = 2,
    Closed = 3,
    Ended = 4,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Ended => "ended",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Connecting,
            1 => ConnectionStatus::Ready,
            2 => ConnectionStatus::Reconnecting,
            3 => ConnectionStatus::Closed,
            _ => ConnectionStatus::Ended,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionStatus::Ready)
    }

    /// Transition table. Re-entering the current state is always allowed.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Connecting, Ready | Closed | Reconnecting) => true,
            (Ready, Closed | Reconnecting) => true,
            (Reconnecting, Connecting | Ready | Closed) => true,
            (Closed, Reconnecting | Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two connections a status refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Publisher,
    Subscriber,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Publisher => "publisher",
            ConnectionRole::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding a [`ConnectionStatus`].
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `status` and return the previous value.
    pub fn swap(&self, status: ConnectionStatus) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.swap(status as u8, Ordering::AcqRel))
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        Self::new(ConnectionStatus::Connecting)
    }
}
