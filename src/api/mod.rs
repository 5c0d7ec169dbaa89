//! HTTP exposition of the agent's own telemetry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{telemetry::Telemetry, CollectorError, Result};

pub fn router(telemetry: Arc<Telemetry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(telemetry)
}

async fn metrics(State(telemetry): State<Arc<Telemetry>>) -> Result<impl IntoResponse> {
    let body = telemetry.encode()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Serves [`router`] on `addr` until `ctx` is cancelled.
pub async fn serve(addr: SocketAddr, telemetry: Arc<Telemetry>, ctx: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CollectorError::Internal(format!("Failed to bind to address {addr}: {e}")))?;
    info!(%addr, "serving telemetry");

    axum::serve(listener, router(telemetry))
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
        .map_err(|e| CollectorError::Internal(format!("Server error: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Outcome;
    use std::time::Duration;

    #[tokio::test]
    async fn serves_metrics_and_health() {
        let telemetry = Arc::new(Telemetry::new().unwrap());
        telemetry.record_cycle("orders", Outcome::Success, Duration::from_millis(5));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = CancellationToken::new();
        let shutdown = ctx.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(telemetry))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains(r#"collector_invocations_total{collector="orders",outcome="success"} 1"#));

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"status": "ok"}));

        ctx.cancel();
        server.await.unwrap().unwrap();
    }
}
