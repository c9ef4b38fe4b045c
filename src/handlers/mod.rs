// ---------------------------------------------------------------------------
// handlers/: admin API for MCP server configuration screens
// Sub-modules group routes; mod.rs re-exports the handlers used by lib.rs
// and holds the shared error type.
// ---------------------------------------------------------------------------

pub(crate) mod events;
pub(crate) mod servers;
pub(crate) mod system;
pub(crate) mod tools;

// ── Re-exports ───────────────────────────────────────────────────────────────

pub use events::server_events;
pub use servers::{
    connect_server, create_server, delete_server, disconnect_server, list_servers, mcp_stats, test_server,
    toggle_server, update_server,
};
pub use system::{health, readiness};
pub use tools::{call_tool, list_tools};

// ── Shared types ─────────────────────────────────────────────────────────────

use axum::Json;
use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::mcp::McpError;

// Jaskier Shared Pattern -- error
/// Centralized API error type for all handlers.
/// Logs full details server-side, returns structured JSON to the client.
///
/// Response format:
/// ```json
/// {
///   "error": {
///     "code": "NOT_FOUND",
///     "message": "Human-readable description",
///     "request_id": "uuid",
///     "mcp_code": "SERVER_NOT_FOUND"   // null unless the cause is an MCP error
///   }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream MCP error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Mcp(#[from] McpError),
}

impl ApiError {
    /// Machine-readable error code string for each variant.
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Timeout(_) => "TIMEOUT",
            ApiError::Mcp(e) => match e {
                McpError::ServerNotFound(_) | McpError::ToolNotFound(_) => "NOT_FOUND",
                McpError::DuplicateServer(_) => "CONFLICT",
                McpError::UnsupportedCapability(_) | McpError::InvalidServerId(_) => "BAD_REQUEST",
                McpError::NotReady(_) | McpError::ConnectionClosed | McpError::ReconnectionExhausted(_) => {
                    "SERVICE_UNAVAILABLE"
                }
                McpError::RequestTimeout { .. } | McpError::HandshakeTimeout(_) => "TIMEOUT",
                McpError::Persistence(_) => "INTERNAL_ERROR",
                McpError::Connect { .. }
                | McpError::ProtocolMismatch(_)
                | McpError::Rpc { .. }
                | McpError::Transport(_)
                | McpError::Codec(_) => "UPSTREAM_ERROR",
            },
        }
    }

    /// HTTP status code, derived from the error code.
    fn status_code(&self) -> StatusCode {
        match self.error_code() {
            "BAD_REQUEST" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONFLICT" => StatusCode::CONFLICT,
            "UPSTREAM_ERROR" => StatusCode::BAD_GATEWAY,
            "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to clients. Internal failures stay generic;
    /// everything else is meant for the operator configuring servers.
    fn sanitized_message(&self) -> String {
        match self {
            ApiError::Internal(_) | ApiError::Mcp(McpError::Persistence(_)) => "Internal server error".to_string(),
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Upstream(m)
            | ApiError::Unavailable(m)
            | ApiError::Timeout(m) => m.clone(),
            ApiError::Mcp(e) => e.to_string(),
        }
    }

    fn mcp_code(&self) -> Option<&'static str> {
        match self {
            ApiError::Mcp(e) => Some(e.code()),
            _ => None,
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let request_id = Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                code = self.error_code(),
                "API error ({}): {}",
                status.as_u16(),
                self
            );
        } else {
            tracing::warn!(
                request_id = %request_id,
                code = self.error_code(),
                "API error ({}): {}",
                status.as_u16(),
                self
            );
        }

        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.sanitized_message(),
                "request_id": request_id,
                "mcp_code": self.mcp_code(),
            }
        });
        (status, Json(body)).into_response()
    }
}
