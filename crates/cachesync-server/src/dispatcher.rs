//! Single consumer of the transport event stream.
//!
//! Status changes, connection errors and inbound messages are handled in the
//! order the transport emitted them.

use std::sync::Arc;

use cachesync_core::{CacheGateway, TransportEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::monitor::ConnectionMonitor;
use crate::router::MessageRouter;

pub struct EventDispatcher {
    monitor: Arc<ConnectionMonitor>,
    router: Arc<MessageRouter>,
    cache: CacheGateway,
}

impl EventDispatcher {
    pub fn new(monitor: Arc<ConnectionMonitor>, router: Arc<MessageRouter>, cache: CacheGateway) -> Self {
        Self { monitor, router, cache }
    }

    pub async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Status { role, status } => {
                trace!(role = %role, status = %status, "status event");
                self.monitor.handle_status(role, status);
            }
            TransportEvent::Error { role, message } => {
                self.monitor.handle_error(role, &message);
            }
            TransportEvent::Message { channel, payload } => {
                self.router.on_message(&channel, &payload).await;
            }
            TransportEvent::PatternMessage {
                pattern,
                channel,
                payload,
            } => {
                self.router.on_pattern_message(&pattern, &channel, &payload).await;
            }
        }
    }

    /// Consume `events` until the stream closes or `shutdown` fires.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => self.handle(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        // Dropped events may include invalidations.
                        warn!(missed, "event dispatcher lagged, clearing local cache");
                        metrics::record_events_lagged(missed);
                        self.cache.clear().await;
                        metrics::record_defensive_clear("lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("transport event stream closed");
                        break;
                    }
                }
            }
            debug!("event dispatcher stopped");
        })
    }
}
