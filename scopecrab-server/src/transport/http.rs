//! HTTP transport
//!
//! # Endpoints
//!
//! ## GET /health
//!
//! Liveness check, never rate limited:
//!
//! ```json
//! { "status": "ok", "cached_scopes": 3, "uptime_seconds": 42 }
//! ```
//!
//! ## GET /metrics
//!
//! Prometheus text format, never rate limited.
//!
//! ## Any other path
//!
//! Goes through admission. Admitted requests get `204 No Content` with the
//! `X-RateLimit-*` headers, so a reverse proxy can use the service for
//! forward authentication. Denied requests get `429` with `Retry-After`;
//! requests that could not be decided get `503`.

use super::Transport;
use crate::middleware::{Dispatcher, admission_middleware};
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::{Router, middleware};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cached_scopes: usize,
    pub uptime_seconds: u64,
}

pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let app = router(dispatcher);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("HTTP server listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// The service's routes with admission applied to the fallback only
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let gated = Router::new()
        .fallback(|| async { StatusCode::NO_CONTENT })
        .layer(middleware::from_fn_with_state(
            Arc::clone(&dispatcher),
            admission_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(dispatcher)
        .merge(gated)
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cached_scopes: dispatcher.cache().len(),
        uptime_seconds: dispatcher.metrics().uptime_seconds(),
    })
}

async fn metrics(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        dispatcher.metrics().export_prometheus(),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
