//! Health and metrics listener.
//!
//! A deliberately small surface: liveness for the orchestrator and the
//! Prometheus scrape endpoint. The analysis read API lives in a separate
//! service.

use crate::error::{DaemonError, DaemonResult};
use crate::metrics;
use crate::storage::AnalysisStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn AnalysisStore>,
    started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(store: Arc<dyn AnalysisStore>) -> Self {
        Self {
            store,
            started_at: Utc::now(),
        }
    }

    fn uptime(&self) -> String {
        format!("{}s", (Utc::now() - self.started_at).num_seconds())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let (status_code, status) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            tracing::warn!(error = %e, "health check database ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: state.uptime(),
        }),
    )
}

async fn metrics_text() -> Result<String, (StatusCode, String)> {
    metrics::render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Serve until the stop signal flips.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut stop: watch::Receiver<bool>,
) -> DaemonResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| DaemonError::Server(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(%addr, "health listener ready");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.changed().await;
        })
        .await
        .map_err(|e| DaemonError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn health_check_reports_healthy_store() {
        let state = ApiState::new(Arc::new(InMemoryStore::new()));
        let (status, body) = health_check(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        metrics::EVENTS_CONSUMED.with_label_values(&["metric"]).inc();
        let response = metrics_text().await.unwrap();
        assert!(response.contains("triage_events_consumed_total"));
    }

    #[tokio::test]
    async fn responses_convert_to_http() {
        let state = ApiState::new(Arc::new(InMemoryStore::new()));
        let response = health_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
