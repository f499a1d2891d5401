//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestration systems
//! to determine if the service is healthy and ready to receive traffic.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::model::ResourceType;
use crate::state::{AppState, WorkerProbe};

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Background worker health.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub reconciler: ComponentStatus,

    pub metrics_aggregator: ComponentStatus,

    /// Non-terminal operations at the time of the check.
    pub operations_in_flight: usize,

    pub clusters: usize,

    pub deployments: usize,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Status: "ok" or "stale".
    pub status: String,

    /// Completion time of the last tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<String>,
}

impl ComponentStatus {
    fn from_probe(probe: &WorkerProbe) -> Self {
        Self {
            status: if probe.is_healthy() { "ok" } else { "stale" }.to_string(),
            last_tick: probe.heartbeat.last().map(|t| t.to_rfc3339()),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Basic health check - is the service running?
///
/// This does not check the background workers.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness check - are reconciliation and metrics aggregation ticking?
///
/// Returns 503 until both workers have completed a recent tick.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.service().resources().counts().await;
    let components = ComponentHealth {
        reconciler: ComponentStatus::from_probe(state.reconciler()),
        metrics_aggregator: ComponentStatus::from_probe(state.aggregator()),
        operations_in_flight: state.service().tracker().in_flight_count().await,
        clusters: counts.get(&ResourceType::Cluster).copied().unwrap_or(0),
        deployments: counts.get(&ResourceType::Deployment).copied().unwrap_or(0),
    };

    let all_ok = components.reconciler.is_ok() && components.metrics_aggregator.is_ok();

    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(components),
    };

    if all_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Liveness check - is the service alive?
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
