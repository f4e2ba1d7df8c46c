use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::metrics;
use crate::service::CacheSyncService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CacheSyncService>,
}

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready only while the subscriber connection is up.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.service.is_healthy() {
        (StatusCode::OK, Json(HealthResponse { status: "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "not ready" }),
        )
    }
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

// ---- Demo cache endpoints ----

pub async fn get_hello(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.get_hello().await {
        Some(value) => value,
        None => "NOT FOUND".to_string(),
    }
}

pub async fn delete_hello(State(state): State<AppState>) -> impl IntoResponse {
    state.service.delete_hello().await;
    "Deleted from cache!"
}

// ---- Pub/sub endpoints ----

pub async fn invalidate_key(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    let receivers = state.service.invalidate(&key).await;
    Json(json!({ "key": key, "receivers": receivers }))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    pub message: String,
}

pub async fn publish(State(state): State<AppState>, Json(req): Json<PublishRequest>) -> impl IntoResponse {
    if req.channel.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "channel must not be empty" })),
        );
    }
    let subscribers = state.service.publish(&req.channel, req.message.as_bytes()).await;
    (StatusCode::OK, Json(json!({ "subscribers": subscribers })))
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub pattern: Option<String>,
}

pub async fn list_channels(State(state): State<AppState>, Query(query): Query<ChannelQuery>) -> impl IntoResponse {
    let channels = state.service.channels_matching(query.pattern.as_deref()).await;
    Json(json!({ "channels": channels }))
}

pub async fn subscriber_count(State(state): State<AppState>, Path(channel): Path<String>) -> impl IntoResponse {
    let count = state.service.subscriber_count(&channel).await;
    Json(json!({ "count": count }))
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.get_cache_status())
}
