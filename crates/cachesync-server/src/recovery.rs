//! Subscription recovery after connection loss or drift.
//!
//! ## Recovery run
//!
//! ```text
//! trigger ──► [single-flight gate] ──► debounce ──► resubscribe desired channels ──► clear local cache
//!                    │ busy                               │ first failure
//!                    ▼                                    ▼
//!                 dropped                     back to idle, retry after backoff
//! ```
//!
//! At most one run is in flight per controller. A trigger that arrives while a
//! run is in progress is dropped; the running attempt (or the retry it
//! schedules) reconciles state. The gate is released by a guard on every exit
//! path, so a failed or cancelled run can never leave recovery stuck.
//!
//! The full clear after a successful resubscription stands in for whatever
//! invalidations were published while this instance was not listening.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use cachesync_core::{BackoffPolicy, CacheGateway, PubSubTransport, SubscriptionRegistry, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// Timings for recovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Pause before a full run starts.
    pub debounce: Duration,
    /// Delay before retrying a failed run.
    pub backoff: BackoffPolicy,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What a recovery run should restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryScope {
    /// Every desired channel and pattern, after the debounce delay.
    Full,
    /// Only these channels, immediately.
    Channels(BTreeSet<String>),
}

impl RecoveryScope {
    fn as_str(&self) -> &'static str {
        match self {
            RecoveryScope::Full => "full",
            RecoveryScope::Channels(_) => "drift",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    #[error("resubscription failed: {0}")]
    Resubscribe(#[from] TransportError),

    #[error("recovery cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Another run was in progress, or there was nothing to do.
    Skipped,
    Recovered { resubscribed: usize, cleared: bool },
    Failed(RecoveryError),
}

/// Single-flight recovery state machine: idle ⇄ recovering.
pub struct RecoveryController {
    transport: Arc<dyn PubSubTransport>,
    registry: Arc<SubscriptionRegistry>,
    cache: CacheGateway,
    policy: RecoveryPolicy,
    recovering: AtomicBool,
    failures: AtomicU32,
    shutdown: CancellationToken,
}

/// Holds the single-flight gate; releases it on drop.
struct RecoveryGuard {
    controller: Arc<RecoveryController>,
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.controller.recovering.store(false, Ordering::Release);
    }
}

impl RecoveryController {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        registry: Arc<SubscriptionRegistry>,
        cache: CacheGateway,
        policy: RecoveryPolicy,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry,
            cache,
            policy,
            recovering: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            shutdown,
        })
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Consecutive failed runs since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Entry point for connection error/close/end events.
    pub fn handle_connection_error(self: &Arc<Self>) -> bool {
        self.trigger(RecoveryScope::Full)
    }

    /// Start a recovery run in the background.
    ///
    /// Returns `false` when a run is already in flight or the service is
    /// shutting down; the trigger is dropped in that case.
    pub fn trigger(self: &Arc<Self>, scope: RecoveryScope) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(guard) = self.try_begin() else {
            debug!(scope = scope.as_str(), "recovery already in progress, trigger dropped");
            return false;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(guard, scope).await;
        });
        true
    }

    /// Run recovery inline and wait for the outcome.
    pub async fn recover(self: &Arc<Self>, scope: RecoveryScope) -> RecoveryOutcome {
        if matches!(&scope, RecoveryScope::Channels(channels) if channels.is_empty()) {
            return RecoveryOutcome::Skipped;
        }
        if self.shutdown.is_cancelled() {
            return RecoveryOutcome::Skipped;
        }
        let Some(guard) = self.try_begin() else {
            debug!(scope = scope.as_str(), "recovery already in progress");
            return RecoveryOutcome::Skipped;
        };
        self.run(guard, scope).await
    }

    fn try_begin(self: &Arc<Self>) -> Option<RecoveryGuard> {
        self.recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecoveryGuard {
                controller: Arc::clone(self),
            })
    }

    async fn run(self: &Arc<Self>, guard: RecoveryGuard, scope: RecoveryScope) -> RecoveryOutcome {
        let outcome = self.attempt(&scope).await;
        // Back to idle before any retry is scheduled.
        drop(guard);

        match &outcome {
            RecoveryOutcome::Recovered { resubscribed, cleared } => {
                self.failures.store(0, Ordering::Release);
                metrics::record_recovery("recovered");
                info!(
                    scope = scope.as_str(),
                    resubscribed = *resubscribed,
                    cleared = *cleared,
                    "subscription recovery completed"
                );
            }
            RecoveryOutcome::Failed(RecoveryError::Cancelled) => {
                metrics::record_recovery("cancelled");
                debug!(scope = scope.as_str(), "recovery cancelled");
            }
            RecoveryOutcome::Failed(e) => {
                let attempt = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                let delay = self.policy.backoff.delay(attempt);
                metrics::record_recovery("failed");
                error!(
                    scope = scope.as_str(),
                    error = %e,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "subscription recovery failed, retry scheduled"
                );
                self.schedule_retry(scope, delay);
            }
            RecoveryOutcome::Skipped => {}
        }

        outcome
    }

    async fn attempt(&self, scope: &RecoveryScope) -> RecoveryOutcome {
        if matches!(scope, RecoveryScope::Full) {
            info!(
                debounce_ms = self.policy.debounce.as_millis() as u64,
                "connection problem detected, recovering subscriptions"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return RecoveryOutcome::Failed(RecoveryError::Cancelled),
                _ = tokio::time::sleep(self.policy.debounce) => {}
            }
        }

        let (channels, patterns) = match scope {
            RecoveryScope::Full => (self.registry.desired(), self.registry.patterns()),
            RecoveryScope::Channels(channels) => (channels.clone(), BTreeSet::new()),
        };

        if let Err(e) = self.resubscribe(&channels).await {
            return RecoveryOutcome::Failed(e);
        }
        if let Err(e) = self.repsubscribe(&patterns).await {
            return RecoveryOutcome::Failed(e);
        }

        let cleared = self.cache.clear().await;
        metrics::record_defensive_clear("recovery");
        RecoveryOutcome::Recovered {
            resubscribed: channels.len() + patterns.len(),
            cleared,
        }
    }

    /// Subscribe to each channel in order; the first failure aborts.
    async fn resubscribe(&self, channels: &BTreeSet<String>) -> Result<(), RecoveryError> {
        for channel in channels {
            if self.shutdown.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }
            self.transport.subscribe(channel).await?;
            debug!(channel = %channel, "resubscribed");
        }
        Ok(())
    }

    async fn repsubscribe(&self, patterns: &BTreeSet<String>) -> Result<(), RecoveryError> {
        for pattern in patterns {
            if self.shutdown.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }
            self.transport.psubscribe(pattern).await?;
            debug!(pattern = %pattern, "pattern resubscribed");
        }
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, scope: RecoveryScope, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !this.trigger(scope) {
                        warn!("scheduled recovery retry skipped, another run is in progress");
                    }
                }
            }
        });
    }
}
