//! Periodic connection health check and subscription reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cachesync_core::SubscriptionRegistry;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::ConnectionMonitor;
use crate::recovery::{RecoveryOutcome, RecoveryScope};

/// Result of one health check tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// Subscriber is ready and every desired channel is active.
    Healthy,
    /// Subscriber is not ready. `triggered` is false when a recovery run was
    /// already in flight.
    Unhealthy { triggered: bool },
    /// Desired channels were missing on the server.
    Drift {
        missing: BTreeSet<String>,
        outcome: RecoveryOutcome,
    },
    /// The channel listing could not be fetched.
    QueryFailed,
}

pub struct HealthScheduler {
    monitor: Arc<ConnectionMonitor>,
    registry: Arc<SubscriptionRegistry>,
    period: Duration,
}

impl HealthScheduler {
    pub fn new(monitor: Arc<ConnectionMonitor>, registry: Arc<SubscriptionRegistry>, period: Duration) -> Self {
        Self {
            monitor,
            registry,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn check_connection_health(&self) -> HealthCheck {
        if !self.monitor.is_healthy() {
            warn!("subscriber connection unhealthy, triggering recovery");
            let triggered = self.monitor.recovery().handle_connection_error();
            return HealthCheck::Unhealthy { triggered };
        }

        let active = match self.monitor.transport().query_channels(None).await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "failed to list active channels");
                return HealthCheck::QueryFailed;
            }
        };

        let missing = self.registry.drift(&active);
        if missing.is_empty() {
            debug!(channels = active.len(), "subscriptions in sync");
            return HealthCheck::Healthy;
        }

        info!(missing = ?missing, "subscription drift detected, resubscribing");
        let outcome = self
            .monitor
            .recovery()
            .recover(RecoveryScope::Channels(missing.clone()))
            .await;
        HealthCheck::Drift { missing, outcome }
    }

    /// Run the check every period until `shutdown` fires.
    ///
    /// The first check happens one period after start. A slow check delays the
    /// next tick instead of bunching ticks together.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = self.period.as_millis() as u64, "health scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_connection_health().await;
                    }
                }
            }
            debug!("health scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{RecoveryController, RecoveryPolicy};
    use cachesync_core::{
        BackoffPolicy, CacheGateway, ConnectionRole, ConnectionStatus, MemoryTransport, PubSubTransport,
    };

    struct Fixture {
        transport: Arc<MemoryTransport>,
        monitor: Arc<ConnectionMonitor>,
        scheduler: Arc<HealthScheduler>,
    }

    fn fixture(channels: &[&str]) -> Fixture {
        let transport = Arc::new(MemoryTransport::standalone());
        let registry = Arc::new(SubscriptionRegistry::with_channels(channels.iter().copied()));
        let recovery = RecoveryController::new(
            transport.clone(),
            registry.clone(),
            CacheGateway::local(8, vec![]),
            RecoveryPolicy {
                debounce: Duration::from_millis(1000),
                backoff: BackoffPolicy::fixed(Duration::from_millis(5000)),
            },
            CancellationToken::new(),
        );
        let monitor = Arc::new(ConnectionMonitor::new(transport.clone(), recovery));
        monitor.sync_from_transport();
        let scheduler = Arc::new(HealthScheduler::new(
            monitor.clone(),
            registry,
            Duration::from_millis(5000),
        ));
        Fixture {
            transport,
            monitor,
            scheduler,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_resubscribes_only_missing_channels() {
        let f = fixture(&["A", "B", "C"]);
        for channel in ["A", "B", "C"] {
            f.transport.subscribe(channel).await.unwrap();
        }
        f.transport.drop_subscription("B");
        f.transport.clear_subscribe_calls();

        let check = f.scheduler.check_connection_health().await;

        let HealthCheck::Drift { missing, outcome } = check else {
            panic!("expected drift, got {check:?}");
        };
        assert_eq!(missing, BTreeSet::from(["B".to_string()]));
        assert!(matches!(outcome, RecoveryOutcome::Recovered { resubscribed: 1, .. }));
        assert_eq!(f.transport.subscribe_calls(), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_sync_is_healthy() {
        let f = fixture(&["A"]);
        f.transport.subscribe("A").await.unwrap();
        assert_eq!(f.scheduler.check_connection_health().await, HealthCheck::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_triggers_recovery() {
        let f = fixture(&["A"]);
        f.monitor
            .handle_status(ConnectionRole::Subscriber, ConnectionStatus::Reconnecting);

        let check = f.scheduler.check_connection_health().await;

        assert_eq!(check, HealthCheck::Unhealthy { triggered: true });
        assert!(f.monitor.recovery().is_recovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_checks_every_period() {
        let f = fixture(&["A"]);
        let shutdown = CancellationToken::new();
        let handle = f.scheduler.clone().start(shutdown.clone());

        // Nothing subscribed yet: the first tick at 5s finds "A" missing.
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(f.transport.subscribe_calls().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.transport.subscribe_calls(), vec!["A"]);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
