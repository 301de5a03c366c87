use axum::Json;
use tracing::debug;

use crate::models::{HealthResponse, ReadyResponse};

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Relay is running".to_string(),
    })
}

/// Readiness check endpoint
pub async fn ready_check() -> Json<ReadyResponse> {
    debug!("Readiness check requested");
    // The relay keeps all state in memory; once the process is up it
    // is ready.
    Json(ReadyResponse {
        status: "ok".to_string(),
        message: "Relay is ready".to_string(),
    })
}
