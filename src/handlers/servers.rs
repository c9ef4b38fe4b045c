// ---------------------------------------------------------------------------
// handlers/servers.rs: Server config CRUD and connection control
// ---------------------------------------------------------------------------

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::mcp::service::{ConnectionTestReport, McpStatistics};
use crate::mcp::transport::TransportKind;
use crate::mcp::{McpError, ServerConfig, ServerConfigPatch, ServerView};
use crate::state::AppState;

use super::ApiError;

fn validate_url(url: &str) -> Result<(), ApiError> {
    TransportKind::from_url(url)
        .map(|_| ())
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn validate(config: &ServerConfig) -> Result<(), ApiError> {
    if config.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Server name must not be empty".into()));
    }
    validate_url(&config.url)
}

fn view(state: &AppState, id: &str) -> Result<Json<ServerView>, ApiError> {
    state
        .service
        .get_server(id)
        .map(Json)
        .ok_or_else(|| McpError::ServerNotFound(id.to_string()).into())
}

/// GET /api/mcp/servers
pub async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerView>> {
    Json(state.service.get_servers())
}

/// POST /api/mcp/servers
pub async fn create_server(
    State(state): State<AppState>,
    Json(config): Json<ServerConfig>,
) -> Result<(StatusCode, Json<ServerView>), ApiError> {
    validate(&config)?;
    let created = state.service.add_server(config).await?;
    let server = view(&state, &created.id)?;
    Ok((StatusCode::CREATED, server))
}

/// PATCH /api/mcp/servers/{id}
pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ServerConfigPatch>,
) -> Result<Json<ServerView>, ApiError> {
    if let Some(url) = &patch.url {
        validate_url(url)?;
    }
    if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest("Server name must not be empty".into()));
    }
    state.service.update_server(&id, patch).await?;
    view(&state, &id)
}

/// DELETE /api/mcp/servers/{id}
pub async fn delete_server(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.service.remove_server(&id).await?;
    Ok(Json(json!({ "deleted": true, "id": id })))
}

/// POST /api/mcp/servers/{id}/toggle
pub async fn toggle_server(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ServerView>, ApiError> {
    state.service.toggle_server(&id).await?;
    view(&state, &id)
}

/// POST /api/mcp/servers/{id}/connect
pub async fn connect_server(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if state.service.get_server(&id).is_none() {
        return Err(McpError::ServerNotFound(id).into());
    }
    let connected = state.service.connect_to_server(&id).await;
    let Json(server) = view(&state, &id)?;
    Ok(Json(json!({ "connected": connected, "server": server })))
}

/// POST /api/mcp/servers/{id}/disconnect
pub async fn disconnect_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerView>, ApiError> {
    state.service.disconnect_server(&id).await?;
    view(&state, &id)
}

/// POST /api/mcp/servers/test: try a config without saving it.
pub async fn test_server(
    State(state): State<AppState>,
    Json(config): Json<ServerConfig>,
) -> Result<Json<ConnectionTestReport>, ApiError> {
    validate_url(&config.url)?;
    Ok(Json(state.service.test_server_connection(config).await))
}

/// GET /api/mcp/stats
pub async fn mcp_stats(State(state): State<AppState>) -> Json<McpStatistics> {
    Json(state.service.get_statistics())
}
