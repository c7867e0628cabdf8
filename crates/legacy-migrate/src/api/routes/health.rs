//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::api::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub legacy_connected: bool,
    pub target_connected: bool,
    pub history_backend: String,
    pub migration_active: bool,
}

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    let (legacy_connected, target_connected) = orchestrator.ping_stores().await;

    Json(HealthResponse {
        status: if legacy_connected && target_connected {
            "healthy"
        } else {
            "degraded"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        legacy_connected,
        target_connected,
        history_backend: orchestrator.history_backend().to_string(),
        migration_active: orchestrator.current().is_some(),
    })
}
