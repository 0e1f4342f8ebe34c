use axum::{Json, extract::State};
use std::sync::Arc;

use super::{ApiResponse, AppState, HealthResponse};

/// Liveness check.
///
/// # Endpoint
/// `GET /api/health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_connections: state.events.get_connection_count(None),
    }))
}
