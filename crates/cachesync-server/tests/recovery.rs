//! Connection loss, drift and recovery driven through the transport event stream.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use cachesync_core::{ConnectionRole, ConnectionStatus, MemoryBus, PubSubTransport};
use cachesync_server::{HealthCheck, RecoveryOutcome};
use common::{TTL, config, instance, settle, started};

fn set(channels: &[&str]) -> BTreeSet<String> {
    channels.iter().map(|c| c.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_health_flag_follows_subscriber_status() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    assert!(x.service.is_healthy());

    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Closed);
    settle().await;
    assert!(!x.service.is_healthy());
    assert!(!x.service.get_cache_status().is_connected);

    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Ready);
    settle().await;
    assert!(x.service.is_healthy());
    assert!(x.service.get_cache_status().is_connected);
}

#[tokio::test(start_paused = true)]
async fn test_two_errors_start_a_single_recovery() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    x.transport.clear_subscribe_calls();

    x.transport.emit_error(ConnectionRole::Subscriber, "connection reset");
    x.transport.emit_error(ConnectionRole::Subscriber, "connection reset");
    settle().await;
    assert!(x.service.monitor().recovery().is_recovering());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;

    assert_eq!(
        x.transport.subscribe_calls(),
        vec!["cache:invalidate".to_string(), "user-events".to_string()]
    );
    assert!(!x.service.monitor().recovery().is_recovering());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_subscriptions_and_clears_cache() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    let y = started(&bus, "y").await;
    y.service.cache().set("hello", b"stale".to_vec(), TTL).await;

    // The broker forgets Y's subscriptions along with the connection.
    y.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Closed);
    y.transport.drop_subscriptions();
    settle().await;

    // An invalidation published during the outage is lost for Y.
    assert_eq!(x.service.invalidate("other").await, 1);

    y.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Ready);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;

    assert_eq!(y.transport.subscriptions(), set(&["cache:invalidate", "user-events"]));
    assert_eq!(y.transport.pattern_subscriptions(), set(&["user:*"]));
    // The defensive clear covers whatever was missed.
    assert!(y.service.cache().get("hello").await.is_none());
    assert_eq!(y.store.clears(), 1);

    y.service.cache().set("hello", b"fresh".to_vec(), TTL).await;
    x.service.invalidate("hello").await;
    settle().await;
    assert!(y.service.cache().get("hello").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_is_retried_after_backoff() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    x.transport.clear_subscribe_calls();
    x.transport.fail_next_subscribes(1);

    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Closed);
    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Ready);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;

    assert_eq!(x.transport.subscribe_calls(), vec!["cache:invalidate".to_string()]);
    assert_eq!(x.service.monitor().recovery().consecutive_failures(), 1);
    assert!(!x.service.monitor().recovery().is_recovering());

    // 5s backoff, then the 1s debounce of the retried run.
    tokio::time::sleep(Duration::from_millis(6100)).await;
    settle().await;

    assert_eq!(x.transport.subscriptions(), set(&["cache:invalidate", "user-events"]));
    assert_eq!(x.service.monitor().recovery().consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drift_resubscribes_only_the_missing_channel() {
    let bus = MemoryBus::new();
    let x = instance(&bus, &config("x", &["A", "B", "C"]));
    x.service.start().await;
    x.transport.drop_subscription("B");
    x.transport.clear_subscribe_calls();

    let check = x.service.scheduler().check_connection_health().await;

    let HealthCheck::Drift { missing, outcome } = check else {
        panic!("expected drift, got {check:?}");
    };
    assert_eq!(missing, set(&["B"]));
    assert!(matches!(outcome, RecoveryOutcome::Recovered { resubscribed: 1, .. }));
    assert_eq!(x.transport.subscribe_calls(), vec!["B".to_string()]);
    assert_eq!(x.transport.subscriptions(), set(&["A", "B", "C"]));
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_repairs_drift_on_its_own() {
    let bus = MemoryBus::new();
    let mut cfg = config("x", &["A", "B"]);
    cfg.pubsub.health_check_interval_ms = 5000;
    let x = instance(&bus, &cfg);
    x.service.start().await;
    x.transport.drop_subscription("A");

    tokio::time::sleep(Duration::from_millis(5100)).await;
    settle().await;

    assert_eq!(x.transport.subscriptions(), set(&["A", "B"]));
    x.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_recovery_keeps_one_entry_per_channel() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;

    for _ in 0..3 {
        x.transport.emit_error(ConnectionRole::Subscriber, "flap");
        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
    }
    x.service.subscribe("cache:invalidate").await;

    assert_eq!(x.service.registry().len(), 2);
    let active = x.transport.query_channels(None).await.unwrap();
    assert!(x.service.registry().drift(active).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_disconnected_is_restored_later() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Reconnecting);
    settle().await;

    assert!(!x.service.subscribe("late").await);
    assert!(x.service.registry().contains("late"));

    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Ready);
    settle().await;
    x.service.scheduler().check_connection_health().await;

    assert!(x.transport.subscriptions().contains("late"));
}
