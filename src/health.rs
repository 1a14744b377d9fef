//! Health check handlers for the worker core.
//!
//! Liveness (`/health`), readiness backed by a Redis `PING` (`/ready`),
//! Prometheus metrics (`/metrics`), and a queue-depth endpoint
//! (`/queue/info`) reporting the inactive set's cardinality and the
//! notification list's length for the configured job type.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broker::BrokerAdapter;
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Redis connection for the readiness `PING` check.
    pub redis: redis::aio::ConnectionManager,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Broker adapter for the job type whose queue depth is reported.
    pub broker: Arc<BrokerAdapter>,
}

impl HealthState {
    pub fn new(
        redis: redis::aio::ConnectionManager,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        broker: Arc<BrokerAdapter>,
    ) -> Self {
        Self {
            redis,
            app_name: app_name.into(),
            app_version: app_version.into(),
            broker,
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler. Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler. Checks Redis connectivity with `PING`.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let mut conn = state.redis.clone();
    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    match result {
        Ok(response) if response == "PONG" => Ok((
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": { "redis": "ok" } })),
        )),
        Ok(response) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("unexpected response: {}", response) }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        )),
    }
}

/// Queue-depth handler for monitoring: the inactive set's cardinality
/// (claimable backlog) and the notification list's length (pending
/// wake-ups, ideally near zero while workers keep up).
pub async fn queue_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let inactive = state.broker.inactive_depth().await;
    let notify = state.broker.notify_depth().await;

    match (inactive, notify) {
        (Ok(inactive_depth), Ok(notify_depth)) => Ok(Json(json!({
            "inactive_depth": inactive_depth,
            "notification_depth": notify_depth,
        }))),
        (inactive, notify) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!(
                    "failed to read queue depth: inactive={:?} notify={:?}",
                    inactive.err().map(|e| e.to_string()),
                    notify.err().map(|e| e.to_string()),
                )
            })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => {
            let metrics_output = handle.render();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                metrics_output,
            )
                .into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Standard health router:
/// - `/health`, `/healthz` - liveness
/// - `/ready`, `/readyz` - readiness
/// - `/queue/info` - queue depth
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/info", get(queue_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            name: "mail-worker".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"mail-worker\""));
    }
}
