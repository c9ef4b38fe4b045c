// ---------------------------------------------------------------------------
// handlers/tools.rs: Aggregated tool namespace and tool calls
// ---------------------------------------------------------------------------

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::mcp::adapter::{FunctionDeclaration, flatten_text};
use crate::mcp::service::ToolHandle;
use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Serialize)]
pub struct ToolEntry {
    /// `"{serverId}:{toolName}"`
    pub key: String,
    #[serde(flatten)]
    pub tool: ToolHandle,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolEntry>,
    pub declarations: Vec<FunctionDeclaration>,
}

/// GET /api/mcp/tools
pub async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let tools = state
        .service
        .get_available_tools()
        .into_iter()
        .map(|(key, tool)| ToolEntry { key, tool })
        .collect();
    Json(ToolsResponse {
        tools,
        declarations: state.adapter.declarations(),
    })
}

/// Either `key` (`"{serverId}:{toolName}"`) or a function `name` from the
/// declarations list.
#[derive(Debug, Deserialize)]
pub struct CallToolRequest {
    pub key: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// POST /api/mcp/tools/call
pub async fn call_tool(State(state): State<AppState>, Json(req): Json<CallToolRequest>) -> Result<Json<Value>, ApiError> {
    let arguments = req.arguments.unwrap_or_else(|| json!({}));
    if !arguments.is_object() {
        return Err(ApiError::BadRequest("'arguments' must be an object".into()));
    }

    let result = match (req.key.as_deref(), req.name.as_deref()) {
        (Some(key), _) => {
            let (server_id, tool) = key
                .split_once(':')
                .ok_or_else(|| ApiError::BadRequest(format!("tool key '{key}' is not 'serverId:toolName'")))?;
            state.service.call_tool(server_id, tool, arguments).await?
        }
        (None, Some(name)) => state.adapter.invoke(name, arguments).await?,
        (None, None) => return Err(ApiError::BadRequest("either 'key' or 'name' is required".into())),
    };

    Ok(Json(json!({ "text": flatten_text(&result), "result": result })))
}
