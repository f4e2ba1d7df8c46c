//! Connection status tracking for the publisher and subscriber connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cachesync_core::{AtomicStatus, ConnectionRole, ConnectionStatus, PubSubTransport};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::recovery::RecoveryController;

/// Owns the transport handle and mirrors the status of both connections.
///
/// Status changes arrive from the event dispatcher. A lost connection hands
/// over to [`RecoveryController`] unless the transport has already announced
/// that it is reconnecting on its own.
pub struct ConnectionMonitor {
    transport: Arc<dyn PubSubTransport>,
    recovery: Arc<RecoveryController>,
    publisher: AtomicStatus,
    subscriber: AtomicStatus,
    reconnecting: AtomicBool,
}

impl ConnectionMonitor {
    pub fn new(transport: Arc<dyn PubSubTransport>, recovery: Arc<RecoveryController>) -> Self {
        Self {
            transport,
            recovery,
            publisher: AtomicStatus::default(),
            subscriber: AtomicStatus::default(),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn PubSubTransport> {
        &self.transport
    }

    pub fn recovery(&self) -> &Arc<RecoveryController> {
        &self.recovery
    }

    /// Take the transport's current statuses without reacting to them.
    ///
    /// Called once before the dispatcher starts so the monitor does not report
    /// `connecting` for a transport that came up before anyone was listening.
    pub fn sync_from_transport(&self) {
        let publisher = self.transport.status(ConnectionRole::Publisher);
        let subscriber = self.transport.status(ConnectionRole::Subscriber);
        self.publisher.swap(publisher);
        self.subscriber.swap(subscriber);
        metrics::set_connected(subscriber.is_ready());
        debug!(
            transport = self.transport.name(),
            publisher = %publisher,
            subscriber = %subscriber,
            "connection status synchronized"
        );
    }

    pub fn status(&self, role: ConnectionRole) -> ConnectionStatus {
        self.cell(role).load()
    }

    /// `true` iff the subscriber connection is `ready`.
    pub fn is_healthy(&self) -> bool {
        self.subscriber.load().is_ready()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn handle_status(&self, role: ConnectionRole, status: ConnectionStatus) {
        // Store first so is_healthy() reflects the change before any reaction.
        let previous = self.cell(role).swap(status);
        if role == ConnectionRole::Subscriber {
            metrics::set_connected(status.is_ready());
        }

        if previous == status {
            return;
        }
        if !previous.can_transition_to(status) {
            warn!(
                role = %role,
                from = %previous,
                to = %status,
                "unexpected connection status transition"
            );
        }

        match status {
            ConnectionStatus::Ready => {
                self.reconnecting.store(false, Ordering::Release);
                info!(role = %role, "connection ready");
            }
            ConnectionStatus::Connecting => {
                debug!(role = %role, "connecting");
            }
            ConnectionStatus::Reconnecting => {
                self.reconnecting.store(true, Ordering::Release);
                info!(role = %role, "connection reconnecting");
            }
            ConnectionStatus::Closed | ConnectionStatus::Ended => {
                warn!(role = %role, status = %status, "connection lost");
                self.connection_lost(role);
            }
        }
    }

    pub fn handle_error(&self, role: ConnectionRole, message: &str) {
        warn!(role = %role, error = %message, "connection error");
        self.connection_lost(role);
    }

    fn connection_lost(&self, role: ConnectionRole) {
        if self.is_reconnecting() {
            debug!(role = %role, "transport is reconnecting, recovery not triggered");
            return;
        }
        self.recovery.handle_connection_error();
    }

    fn cell(&self, role: ConnectionRole) -> &AtomicStatus {
        match role {
            ConnectionRole::Publisher => &self.publisher,
            ConnectionRole::Subscriber => &self.subscriber,
        }
    }
}
