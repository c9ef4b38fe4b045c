// Jaskier Shared Pattern -- mcp/adapter
//! Bridges discovered MCP tools to function-calling declarations.
//!
//! Each tool becomes `mcp_{server}_{tool}` (lowercase, `[a-z0-9_]` only),
//! with its description prefixed by `[MCP: {server name}]` and its input
//! schema normalised to an object schema. Calls come back in by that name.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::McpError;
use super::service::{McpService, ToolHandle};
use super::types::empty_object_schema;

/// One entry of a model's `function_declarations`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone)]
pub struct ToolInvocationAdapter {
    service: McpService,
}

impl ToolInvocationAdapter {
    pub fn new(service: McpService) -> Self {
        Self { service }
    }

    /// Current tools under their function names. Name collisions get a
    /// numeric suffix, assigned in key order so they are stable.
    fn named_tools(&self) -> Vec<(String, ToolHandle)> {
        let mut taken = HashSet::new();
        self.service
            .get_available_tools()
            .into_values()
            .map(|tool| {
                let base = function_name(&tool.server_name, &tool.name);
                let mut name = base.clone();
                let mut n = 2;
                while !taken.insert(name.clone()) {
                    name = format!("{base}_{n}");
                    n += 1;
                }
                (name, tool)
            })
            .collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.named_tools()
            .into_iter()
            .map(|(name, tool)| {
                let desc = tool.description.as_deref().unwrap_or("External MCP tool");
                FunctionDeclaration {
                    name,
                    description: format!("[MCP: {}] {}", tool.server_name, desc),
                    parameters: normalize_schema(&tool.input_schema),
                }
            })
            .collect()
    }

    pub fn resolve(&self, function_name: &str) -> Option<ToolHandle> {
        self.named_tools()
            .into_iter()
            .find(|(name, _)| name == function_name)
            .map(|(_, tool)| tool)
    }

    /// Route a model's function call to the owning server.
    pub async fn invoke(&self, function_name: &str, arguments: Value) -> Result<Value, McpError> {
        let tool = self
            .resolve(function_name)
            .ok_or_else(|| McpError::ToolNotFound(function_name.to_string()))?;
        tracing::debug!("MCP: invoking '{}' on '{}'", tool.name, tool.server_name);
        tool.execute(arguments).await
    }

    /// Like [`invoke`](Self::invoke), flattened to text.
    pub async fn invoke_text(&self, function_name: &str, arguments: Value) -> Result<String, McpError> {
        self.invoke(function_name, arguments).await.map(|v| flatten_text(&v))
    }
}

/// `mcp_{server}_{tool}`, sanitized.
pub fn function_name(server_name: &str, tool_name: &str) -> String {
    format!("mcp_{}_{}", sanitize(server_name), sanitize(tool_name))
}

fn sanitize(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            result.push(ch.to_ascii_lowercase());
        } else if !result.ends_with('_') {
            result.push('_');
        }
    }
    let trimmed = result.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Guarantee `{"type":"object","properties":{...}}`.
pub fn normalize_schema(schema: &Value) -> Value {
    let Value::Object(obj) = schema else {
        return empty_object_schema();
    };
    let mut obj: Map<String, Value> = obj.clone();
    obj.entry("type").or_insert_with(|| Value::String("object".into()));
    if !obj.get("properties").is_some_and(Value::is_object) {
        obj.insert("properties".into(), Value::Object(Map::new()));
    }
    Value::Object(obj)
}

/// Join the `text` parts of a `tools/call` result. Results without text
/// parts come back as their JSON.
pub fn flatten_text(result: &Value) -> String {
    if let Some(content) = result.get("content") {
        if let Some(arr) = content.as_array() {
            let texts: Vec<&str> = arr
                .iter()
                .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect();
            if !texts.is_empty() {
                return texts.join("\n");
            }
        }
        return content.to_string();
    }
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("my-server"), "my_server");
        assert_eq!(sanitize("My Server 2"), "my_server_2");
        assert_eq!(sanitize("a--b"), "a_b");
        assert_eq!(sanitize("UPPER"), "upper");
        assert_eq!(sanitize("--"), "unnamed");
    }

    #[test]
    fn function_names_are_namespaced() {
        assert_eq!(function_name("Web Search", "search.query"), "mcp_web_search_search_query");
    }

    #[test]
    fn schemas_are_normalised() {
        assert_eq!(normalize_schema(&Value::Null), empty_object_schema());
        assert_eq!(
            normalize_schema(&json!({ "required": ["q"] })),
            json!({ "type": "object", "properties": {}, "required": ["q"] })
        );
        let full = json!({ "type": "object", "properties": { "q": { "type": "string" } } });
        assert_eq!(normalize_schema(&full), full);
    }

    #[test]
    fn flattens_text_parts() {
        let result = json!({ "content": [
            { "type": "text", "text": "one" },
            { "type": "image", "data": "..." },
            { "type": "text", "text": "two" }
        ]});
        assert_eq!(flatten_text(&result), "one\ntwo");
        assert_eq!(flatten_text(&json!({ "content": [] })), "[]");
        assert_eq!(flatten_text(&json!({ "value": 1 })), r#"{"value":1}"#);
    }
}
