//! Standalone webhook server.
//!
//! Provides:
//! - `POST /` and `POST /hook` - push event delivery
//! - `GET /health` - liveness check

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tracing::info;

use crate::receiver::{Receiver, SIGNATURE_HEADERS};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub receiver: Arc<Receiver>,
    pub version: &'static str,
    pub started_at: Instant,
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", post(hook_handler))
        .route("/hook", post(hook_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// First non-empty signature header.
pub fn signature_from_headers(headers: &HeaderMap) -> Option<String> {
    SIGNATURE_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

async fn hook_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = signature_from_headers(&headers);
    let outcome = state.receiver.handle(&body, signature.as_deref()).await;
    (
        outcome.status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        outcome.body,
    )
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "repositories": state.receiver.config().repos.len(),
    }))
}

/// Serve until SIGINT or SIGTERM.
pub async fn run(state: HttpState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Webhook receiver listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Webhook receiver stopped");
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}
