//! HTTP surface, exercised through the router without binding a socket.

mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use cachesync_core::{ConnectionRole, ConnectionStatus, MemoryBus};
use cachesync_server::build_app;
use common::{settle, started};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn text(app: &Router, method: &str, uri: &str) -> String {
    let (status, body) = send(app, method, uri, None).await;
    assert_eq!(status, StatusCode::OK);
    String::from_utf8(body).unwrap()
}

async fn json_body(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Value {
    let (status, body) = send(app, method, uri, body).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_hello_round_trip() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    let app = build_app(x.service.clone());

    assert_eq!(text(&app, "GET", "/").await, "NOT FOUND");
    assert_eq!(text(&app, "GET", "/").await, "Hello World!");

    assert_eq!(text(&app, "GET", "/delete").await, "Deleted from cache!");
    settle().await;

    assert_eq!(text(&app, "GET", "/").await, "NOT FOUND");
}

#[tokio::test]
async fn test_status_reports_connection_and_channels() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    let app = build_app(x.service.clone());

    let body = json_body(&app, "GET", "/status", None).await;
    assert_eq!(
        body,
        json!({
            "isConnected": true,
            "subscribedChannels": ["cache:invalidate", "user-events"]
        })
    );
}

#[tokio::test]
async fn test_readyz_follows_subscriber_health() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    let app = build_app(x.service.clone());

    let (status, _) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);

    x.transport
        .set_status(ConnectionRole::Subscriber, ConnectionStatus::Closed);
    settle().await;

    let (status, _) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = send(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_invalidate_and_publish_report_receivers() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    let _y = started(&bus, "y").await;
    let app = build_app(x.service.clone());

    let body = json_body(&app, "POST", "/invalidate/hello", None).await;
    assert_eq!(body, json!({ "key": "hello", "receivers": 2 }));

    let body = json_body(
        &app,
        "POST",
        "/publish",
        Some(json!({ "channel": "user-events", "message": "{\"type\":\"hello\"}" })),
    )
    .await;
    assert_eq!(body, json!({ "subscribers": 2 }));

    let (status, _) = send(
        &app,
        "POST",
        "/publish",
        Some(json!({ "channel": "", "message": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_channel_queries() {
    let bus = MemoryBus::new();
    let x = started(&bus, "x").await;
    let _y = started(&bus, "y").await;
    let app = build_app(x.service.clone());

    let body = json_body(&app, "GET", "/subscriptions", None).await;
    assert_eq!(body, json!({ "channels": ["cache:invalidate", "user-events"] }));

    let body = json_body(&app, "GET", "/subscriptions?pattern=user-*", None).await;
    assert_eq!(body, json!({ "channels": ["user-events"] }));

    let body = json_body(&app, "GET", "/subscribers/user-events", None).await;
    assert_eq!(body, json!({ "count": 2 }));

    let body = json_body(&app, "GET", "/subscribers/nobody", None).await;
    assert_eq!(body, json!({ "count": 0 }));
}
