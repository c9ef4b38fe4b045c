// ---------------------------------------------------------------------------
// handlers/system.rs: Health and readiness
// ---------------------------------------------------------------------------

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub servers_total: usize,
    pub servers_connected: usize,
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.service.get_statistics();
    Json(HealthResponse {
        status: if state.is_ready() { "ok" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: env!("CARGO_PKG_NAME").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        servers_total: stats.total_servers,
        servers_connected: stats.connected,
    })
}

/// GET /api/health/ready: lightweight readiness check.
pub async fn readiness(State(state): State<AppState>) -> axum::response::Response {
    let ready = state.is_ready();
    let uptime = state.start_time.elapsed().as_secs();
    let body = json!({ "ready": ready, "uptime_seconds": uptime });

    if ready {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
