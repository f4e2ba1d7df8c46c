//! Prometheus metrics for the invalidation service.
//!
//! This module provides:
//! - HTTP request metrics (count, latency)
//! - Inbound pub/sub message metrics (by channel kind and outcome)
//! - Recovery and defensive clear metrics
//! - Subscriber connection health

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Latency buckets in seconds. Handlers here touch only local state and one
/// Redis round trip.
const HTTP_BUCKETS: &[f64] = &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    // Pub/sub metrics
    pub const PUBSUB_MESSAGES_TOTAL: &str = "pubsub_messages_total";
    pub const PUBSUB_PUBLISHED_TOTAL: &str = "pubsub_published_total";
    pub const PUBSUB_EVENTS_LAGGED_TOTAL: &str = "pubsub_events_lagged_total";
    pub const PUBSUB_CONNECTED: &str = "pubsub_connected";

    // Invalidation metrics
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
    pub const CACHE_DEFENSIVE_CLEARS_TOTAL: &str = "cache_defensive_clears_total";
    pub const RECOVERY_RUNS_TOTAL: &str = "recovery_runs_total";
}

/// Install the Prometheus recorder. `/metrics` renders from its handle.
///
/// Returns `false` if a recorder is already installed or installation failed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let builder = match PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
        HTTP_BUCKETS,
    ) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!(error = %e, "Invalid Prometheus bucket configuration");
            return false;
        }
    };

    let handle = match builder.install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            return false;
        }
    };
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        return false;
    }

    describe_metrics();
    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!(names::HTTP_REQUESTS_TOTAL, "HTTP requests by method, route and status");
    describe_histogram!(names::HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency");
    describe_counter!(
        names::PUBSUB_MESSAGES_TOTAL,
        "Inbound pub/sub messages by channel kind and routing outcome"
    );
    describe_counter!(names::PUBSUB_PUBLISHED_TOTAL, "Outbound publications by result");
    describe_counter!(
        names::PUBSUB_EVENTS_LAGGED_TOTAL,
        "Transport events dropped because the dispatcher fell behind"
    );
    describe_gauge!(names::PUBSUB_CONNECTED, "1 while the subscriber connection is ready");
    describe_counter!(names::CACHE_INVALIDATIONS_TOTAL, "Single-key invalidations applied locally");
    describe_counter!(
        names::CACHE_DEFENSIVE_CLEARS_TOTAL,
        "Full local cache clears by reason; a spike points at a misbehaving publisher"
    );
    describe_counter!(names::RECOVERY_RUNS_TOTAL, "Recovery runs by outcome");
}

/// Prometheus text exposition, `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record an HTTP request. `route` is the matched route template, not the raw path.
pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an inbound message and what the router did with it.
pub fn record_message(channel_kind: &str, outcome: &str) {
    counter!(
        names::PUBSUB_MESSAGES_TOTAL,
        "channel_kind" => channel_kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an outbound publication.
pub fn record_published(channel: &str, ok: bool) {
    counter!(
        names::PUBSUB_PUBLISHED_TOTAL,
        "channel" => channel.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record transport events missed because the dispatcher fell behind.
pub fn record_events_lagged(count: u64) {
    counter!(names::PUBSUB_EVENTS_LAGGED_TOTAL).increment(count);
}

/// Set the subscriber connection health gauge.
pub fn set_connected(connected: bool) {
    gauge!(names::PUBSUB_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

/// Record a single-key invalidation applied to the local cache.
pub fn record_invalidation(source: &str) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL, "source" => source.to_string()).increment(1);
}

/// Record a full local clear and why it happened.
pub fn record_defensive_clear(reason: &str) {
    counter!(names::CACHE_DEFENSIVE_CLEARS_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Record the end of a recovery run.
pub fn record_recovery(outcome: &str) {
    counter!(names::RECOVERY_RUNS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_message("invalidation", "applied");
        record_defensive_clear("malformed");
        record_recovery("recovered");
        set_connected(true);
        record_http_request("GET", "/status", 200, Duration::from_millis(3));
    }
}
