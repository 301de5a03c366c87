use axum::{routing::get, Router};
use std::sync::Arc;

use crate::handlers::{diagnostics, health_check, ready_check};
use crate::relay::registry::RoomRegistry;

/// Create API routes
pub fn create_api_routes(registry: Arc<RoomRegistry>) -> Router {
    Router::<Arc<RoomRegistry>>::new()
        .route("/v1/health", get(health_check))
        .route("/v1/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .with_state(registry)
}
