// Jaskier Shared Pattern -- mcp/types
//! Data model: persisted server configs, per-server runtime state and the
//! descriptors discovered from a server.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ── Server configuration (persisted) ────────────────────────────────────────

/// A user-authored MCP server entry. This is the only type that is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// Static headers attached to every leg of the transport (e.g. bearer tokens).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            url: url.into(),
            headers: HashMap::new(),
            enabled: true,
        }
    }
}

/// Partial update for [`ServerConfig`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub enabled: Option<bool>,
}

impl ServerConfigPatch {
    /// Apply in place. Returns `true` when a field that affects the live
    /// connection (`url` or `headers`) actually changed.
    pub fn apply(&self, cfg: &mut ServerConfig) -> bool {
        let mut connection_changed = false;
        if let Some(name) = &self.name {
            cfg.name = name.clone();
        }
        if let Some(description) = &self.description {
            cfg.description = description.clone();
        }
        if let Some(url) = &self.url {
            connection_changed |= *url != cfg.url;
            cfg.url = url.clone();
        }
        if let Some(headers) = &self.headers {
            connection_changed |= *headers != cfg.headers;
            cfg.headers = headers.clone();
        }
        if let Some(enabled) = self.enabled {
            cfg.enabled = enabled;
        }
        connection_changed
    }
}

// ── Capabilities ────────────────────────────────────────────────────────────

/// The three negotiable MCP capability families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Tools,
    Resources,
    Prompts,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Tools, Capability::Resources, Capability::Prompts];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::Resources => "resources",
            Capability::Prompts => "prompts",
        }
    }

    /// Discovery method, e.g. `tools/list`.
    pub fn list_method(self) -> &'static str {
        match self {
            Capability::Tools => "tools/list",
            Capability::Resources => "resources/list",
            Capability::Prompts => "prompts/list",
        }
    }

    /// Server notification that invalidates this capability's list.
    pub fn list_changed_method(self) -> &'static str {
        match self {
            Capability::Tools => "notifications/tools/list_changed",
            Capability::Resources => "notifications/resources/list_changed",
            Capability::Prompts => "notifications/prompts/list_changed",
        }
    }

    pub fn from_list_changed(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.list_changed_method() == method)
    }

    /// Capabilities advertised in an `initialize` result's `capabilities` object.
    pub fn parse_advertised(capabilities: &Value) -> BTreeSet<Capability> {
        Self::ALL
            .into_iter()
            .filter(|cap| {
                capabilities
                    .get(cap.as_str())
                    .is_some_and(|v| !v.is_null() && v.as_bool() != Some(false))
            })
            .collect()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Discovered descriptors ──────────────────────────────────────────────────

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

pub(crate) fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// A resource advertised by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A prompt template advertised by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// `serverInfo` from the `initialize` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

// ── Runtime state (never persisted) ─────────────────────────────────────────

/// Protocol state of a single client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientPhase {
    Idle,
    Connecting,
    Initializing,
    Ready,
    Degraded,
    Closed,
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientPhase::Idle => "idle",
            ClientPhase::Connecting => "connecting",
            ClientPhase::Initializing => "initializing",
            ClientPhase::Ready => "ready",
            ClientPhase::Degraded => "degraded",
            ClientPhase::Closed => "closed",
        })
    }
}

/// User-facing connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// In-memory mirror of one server's connection, published by value from the
/// owning client to the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerRuntimeState {
    pub status: ServerStatus,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub capabilities: BTreeSet<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    /// Monotonic per-client counter; the registry drops snapshots older than
    /// the one it already holds.
    #[serde(skip)]
    pub revision: u64,
}

impl ServerRuntimeState {
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            status: ServerStatus::Error,
            last_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Drop everything learned from the server, keeping diagnostics.
    pub(crate) fn clear_discovery(&mut self) {
        self.tools.clear();
        self.resources.clear();
        self.prompts.clear();
        self.capabilities.clear();
    }
}

/// One entry of the full server list handed to listeners and the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    pub config: ServerConfig,
    pub state: ServerRuntimeState,
}
