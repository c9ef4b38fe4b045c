pub mod handlers;
pub mod mcp;
pub mod settings;
pub mod state;

use axum::Router;
use axum::routing::{get, patch, post};

use state::AppState;

/// Build the admin router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        .route("/api/health/ready", get(handlers::readiness))
        // Servers
        .route("/api/mcp/servers", get(handlers::list_servers).post(handlers::create_server))
        .route("/api/mcp/servers/test", post(handlers::test_server))
        .route(
            "/api/mcp/servers/{id}",
            patch(handlers::update_server).delete(handlers::delete_server),
        )
        .route("/api/mcp/servers/{id}/toggle", post(handlers::toggle_server))
        .route("/api/mcp/servers/{id}/connect", post(handlers::connect_server))
        .route("/api/mcp/servers/{id}/disconnect", post(handlers::disconnect_server))
        // Tools
        .route("/api/mcp/tools", get(handlers::list_tools))
        .route("/api/mcp/tools/call", post(handlers::call_tool))
        // Stats / events
        .route("/api/mcp/stats", get(handlers::mcp_stats))
        .route("/api/mcp/events", get(handlers::server_events))
        .with_state(state)
}
