use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::handlers::{self, AppState};
use crate::metrics;
use crate::service::CacheSyncService;

pub fn build_app(service: Arc<CacheSyncService>) -> Router {
    let state = AppState { service };
    Router::new()
        // Demo cache endpoints
        .route("/", get(handlers::get_hello))
        .route("/delete", get(handlers::delete_hello))
        // Pub/sub endpoints
        .route("/invalidate/{key}", post(handlers::invalidate_key))
        .route("/publish", post(handlers::publish))
        .route("/subscriptions", get(handlers::list_channels))
        .route("/subscribers/{channel}", get(handlers::subscriber_count))
        .route("/status", get(handlers::status))
        // Health and metrics
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics_endpoint))
        .with_state(state)
        // Outermost first: trace -> metrics
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|req: &Request<_>| {
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri(),
                            )
                        })
                        .on_response(|res: &Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                            tracing::debug!(
                                http.status = %res.status().as_u16(),
                                elapsed_ms = %latency.as_millis(),
                                "request handled"
                            );
                        }),
                )
                .layer(middleware::from_fn(record_http_metrics)),
        )
}

/// Count and time every request by its route template.
async fn record_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(req).await;

    metrics::record_http_request(&method, &route, response.status().as_u16(), started.elapsed());
    response
}

/// Bind the first free port in the configured range.
pub async fn bind_with_fallback(cfg: &AppConfig) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let candidates = cfg.candidate_addrs();
    for addr in &candidates {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                return Ok((listener, local));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(port = addr.port(), "port is busy, trying the next one");
            }
            Err(e) => return Err(anyhow::anyhow!("failed to bind {addr}: {e}")),
        }
    }
    anyhow::bail!(
        "no free port between {} and {}",
        cfg.server.port,
        candidates.last().map_or(cfg.server.port, SocketAddr::port)
    )
}

pub struct CacheSyncServer {
    listener: TcpListener,
    addr: SocketAddr,
    service: Arc<CacheSyncService>,
}

impl CacheSyncServer {
    pub async fn bind(cfg: &AppConfig, service: Arc<CacheSyncService>) -> anyhow::Result<Self> {
        let (listener, addr) = bind_with_fallback(cfg).await?;
        Ok(Self {
            listener,
            addr,
            service,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until Ctrl+C, then stop the invalidation service.
    pub async fn run(self) -> anyhow::Result<()> {
        let app = build_app(Arc::clone(&self.service));
        tracing::info!("listening on {}", self.addr);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.service.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_fails_when_every_port_is_busy() {
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let mut cfg = AppConfig::default();
        cfg.server.host = "127.0.0.1".to_string();
        cfg.server.port = port;
        cfg.server.port_attempts = 1;
        assert!(bind_with_fallback(&cfg).await.is_err());
    }
}
