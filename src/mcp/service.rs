// Jaskier Shared Pattern -- mcp/service
//! Registry of configured MCP servers and their live clients.
//!
//! The service owns `id -> client`, persists every config mutation through
//! the injected [`ConfigStore`] before acting on it, and tells observers
//! about every change: registered listeners are called with the full server
//! list (in registration order, each call isolated), and the same snapshot
//! goes out on a broadcast channel.
//!
//! Clients publish their runtime state by value. Each client is tagged with
//! a generation when it is created; snapshots from an older generation, or
//! with a revision not newer than the stored one, are dropped.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::client::{ClientSettings, McpClient, StatePublisher};
use super::error::McpError;
use super::store::ConfigStore;
use super::transport::TransportFactory;
use super::types::{
    PromptDescriptor, ResourceDescriptor, ServerConfig, ServerConfigPatch, ServerInfo, ServerRuntimeState,
    ServerStatus, ServerView, ToolDescriptor,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Joins server id and tool name in registry keys.
pub const TOOL_KEY_SEPARATOR: char = ':';

pub type Snapshot = Arc<Vec<ServerView>>;
type Listener = Arc<dyn Fn(&[ServerView]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId(u64);

// ── Outward views ───────────────────────────────────────────────────────────

/// A callable tool from a connected server. Holds the owning client, so
/// `execute` fails fast with `ConnectionClosed` once that server is
/// disconnected.
#[derive(Clone, Serialize)]
pub struct ToolHandle {
    pub server_id: String,
    pub server_name: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(skip)]
    client: McpClient,
}

impl ToolHandle {
    pub async fn execute(&self, arguments: Value) -> Result<Value, McpError> {
        self.client.call_tool(&self.name, arguments).await
    }
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("server_id", &self.server_id)
            .field("name", &self.name)
            .finish()
    }
}

/// A descriptor tagged with the server it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Scoped<T> {
    pub server_id: String,
    pub server_name: String,
    #[serde(flatten)]
    pub item: T,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ResourceDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<PromptDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct McpStatistics {
    pub total_servers: usize,
    pub enabled_servers: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub errored: usize,
    pub total_tools: usize,
    pub total_resources: usize,
    pub total_prompts: usize,
}

// ── Internals ───────────────────────────────────────────────────────────────

struct RuntimeSlot {
    generation: u64,
    state: ServerRuntimeState,
}

#[derive(Default)]
struct Registry {
    configs: Vec<ServerConfig>,
    clients: HashMap<String, McpClient>,
    runtime: HashMap<String, RuntimeSlot>,
    next_generation: u64,
}

impl Registry {
    fn config(&self, id: &str) -> Option<&ServerConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    fn state(&self, id: &str) -> ServerRuntimeState {
        self.runtime.get(id).map(|slot| slot.state.clone()).unwrap_or_default()
    }

    /// Start a new generation for `id` with a blank state.
    fn reset(&mut self, id: &str) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.runtime.insert(
            id.to_string(),
            RuntimeSlot {
                generation,
                state: ServerRuntimeState::default(),
            },
        );
        generation
    }

    fn views(&self) -> Vec<ServerView> {
        self.configs
            .iter()
            .map(|config| ServerView {
                config: config.clone(),
                state: self.state(&config.id),
            })
            .collect()
    }
}

struct ServiceInner {
    store: Arc<dyn ConfigStore>,
    factory: Arc<dyn TransportFactory>,
    settings: ClientSettings,
    registry: RwLock<Registry>,
    /// Serializes config mutations so persisted order matches memory.
    mutations: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    events: broadcast::Sender<Snapshot>,
}

// ── Service ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct McpService {
    inner: Arc<ServiceInner>,
}

impl McpService {
    pub fn new(store: Arc<dyn ConfigStore>, factory: Arc<dyn TransportFactory>, settings: ClientSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                store,
                factory,
                settings,
                registry: RwLock::new(Registry::default()),
                mutations: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                events,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.registry.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().unwrap_or_else(|p| p.into_inner())
    }

    // ── Startup / shutdown ──────────────────────────────────────────────

    /// Load persisted configs and start connecting every enabled server in
    /// the background.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let mut configs = self.inner.store.load_server_configs().await?;
        configs.retain(|c| {
            let valid = !c.id.contains(TOOL_KEY_SEPARATOR);
            if !valid {
                tracing::warn!(
                    "MCP: ignoring stored server '{}': {}",
                    c.name,
                    McpError::InvalidServerId(c.id.clone())
                );
            }
            valid
        });
        let enabled: Vec<String> = configs.iter().filter(|c| c.enabled).map(|c| c.id.clone()).collect();
        tracing::info!(
            "MCP: loaded {} server config(s), {} enabled",
            configs.len(),
            enabled.len()
        );
        self.write().configs = configs;
        self.notify();

        for id in enabled {
            let service = self.clone();
            tokio::spawn(async move {
                service.connect_to_server(&id).await;
            });
        }
        Ok(())
    }

    /// Close every client.
    pub async fn shutdown(&self) {
        let clients: Vec<McpClient> = {
            let mut registry = self.write();
            let ids: Vec<String> = registry.clients.keys().cloned().collect();
            for id in &ids {
                registry.reset(id);
            }
            registry.clients.drain().map(|(_, c)| c).collect()
        };
        tracing::info!("MCP: shutting down {} client(s)", clients.len());
        for client in clients {
            client.close().await;
        }
        self.notify();
    }

    // ── Config mutations ────────────────────────────────────────────────

    /// Register a server. An empty id gets a fresh UUID.
    pub async fn add_server(&self, mut config: ServerConfig) -> Result<ServerConfig, McpError> {
        {
            let _serial = self.inner.mutations.lock().await;
            if config.id.trim().is_empty() {
                config.id = Uuid::new_v4().to_string();
            }
            if config.id.contains(TOOL_KEY_SEPARATOR) {
                return Err(McpError::InvalidServerId(config.id));
            }
            let mut next = self.configs();
            if next.iter().any(|c| c.id == config.id) {
                return Err(McpError::DuplicateServer(config.id));
            }
            next.push(config.clone());
            self.inner.store.save_server_configs(&next).await?;
            self.write().configs = next;
        }
        tracing::info!("MCP: added server '{}' ({})", config.name, config.id);
        self.notify();

        if config.enabled {
            self.connect_to_server(&config.id).await;
        }
        Ok(config)
    }

    /// Apply a partial update. A connected server reconnects when its URL or
    /// headers change; enabling or disabling connects or disconnects it.
    pub async fn update_server(&self, id: &str, patch: ServerConfigPatch) -> Result<ServerConfig, McpError> {
        let (updated, connection_changed) = {
            let _serial = self.inner.mutations.lock().await;
            let mut next = self.configs();
            let cfg = next
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| McpError::ServerNotFound(id.to_string()))?;
            let connection_changed = patch.apply(cfg);
            let updated = cfg.clone();
            self.inner.store.save_server_configs(&next).await?;
            self.write().configs = next;
            (updated, connection_changed)
        };
        tracing::info!("MCP: updated server '{}' ({})", updated.name, id);
        self.notify();

        let has_client = self.read().clients.contains_key(id);
        if !updated.enabled {
            if has_client {
                self.disconnect_server(id).await?;
            }
        } else if !has_client || connection_changed {
            self.connect_to_server(id).await;
        }
        Ok(updated)
    }

    /// Close the server's client, then forget it.
    pub async fn remove_server(&self, id: &str) -> Result<(), McpError> {
        if self.read().config(id).is_none() {
            return Err(McpError::ServerNotFound(id.to_string()));
        }
        self.disconnect_quietly(id).await;
        {
            let _serial = self.inner.mutations.lock().await;
            let mut next = self.configs();
            next.retain(|c| c.id != id);
            self.inner.store.save_server_configs(&next).await?;
            let mut registry = self.write();
            registry.configs = next;
            registry.runtime.remove(id);
        }
        tracing::info!("MCP: removed server {}", id);
        self.notify();
        Ok(())
    }

    /// Flip `enabled`. Returns the new value.
    pub async fn toggle_server(&self, id: &str) -> Result<bool, McpError> {
        let enabled = {
            let _serial = self.inner.mutations.lock().await;
            let mut next = self.configs();
            let cfg = next
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| McpError::ServerNotFound(id.to_string()))?;
            cfg.enabled = !cfg.enabled;
            let enabled = cfg.enabled;
            self.inner.store.save_server_configs(&next).await?;
            self.write().configs = next;
            enabled
        };
        tracing::info!("MCP: server {} {}", id, if enabled { "enabled" } else { "disabled" });
        self.notify();

        if enabled {
            self.connect_to_server(id).await;
        } else {
            self.disconnect_server(id).await?;
        }
        Ok(enabled)
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// (Re)connect one server. Never fails: errors are recorded in the
    /// server's runtime state and `false` is returned.
    pub async fn connect_to_server(&self, id: &str) -> bool {
        let Some(config) = self.read().config(id).cloned() else {
            tracing::warn!("MCP: cannot connect unknown server {}", id);
            return false;
        };
        if !config.enabled {
            tracing::warn!("MCP: not connecting disabled server '{}'", config.name);
            return false;
        }

        let (client, previous) = {
            let mut registry = self.write();
            let generation = registry.reset(id);
            let client = McpClient::with_publisher(
                config.clone(),
                self.inner.settings.clone(),
                self.inner.factory.clone(),
                self.publisher(id, generation),
            );
            let previous = registry.clients.insert(id.to_string(), client.clone());
            (client, previous)
        };
        if let Some(previous) = previous {
            previous.close().await;
        }

        match client.connect().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("MCP: connection to '{}' failed: {}", config.name, e);
                let mut registry = self.write();
                if registry.clients.get(id).is_some_and(|c| c.ptr_eq(&client)) {
                    registry.clients.remove(id);
                }
                false
            }
        }
    }

    /// Close the server's client and reset its state to `disconnected`.
    pub async fn disconnect_server(&self, id: &str) -> Result<(), McpError> {
        if self.read().config(id).is_none() {
            return Err(McpError::ServerNotFound(id.to_string()));
        }
        self.disconnect_quietly(id).await;
        self.notify();
        Ok(())
    }

    async fn disconnect_quietly(&self, id: &str) {
        let client = {
            let mut registry = self.write();
            registry.reset(id);
            registry.clients.remove(id)
        };
        if let Some(client) = client {
            client.close().await;
        }
    }

    fn publisher(&self, id: &str, generation: u64) -> StatePublisher {
        let weak = Arc::downgrade(&self.inner);
        let id = id.to_string();
        Arc::new(move |state: ServerRuntimeState| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = McpService { inner };
            if service.accept_state(&id, generation, state) {
                service.notify();
            }
        })
    }

    fn accept_state(&self, id: &str, generation: u64, state: ServerRuntimeState) -> bool {
        let mut registry = self.write();
        match registry.runtime.get_mut(id) {
            Some(slot) if slot.generation == generation && state.revision > slot.state.revision => {
                slot.state = state;
                true
            }
            _ => false,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    fn configs(&self) -> Vec<ServerConfig> {
        self.read().configs.clone()
    }

    /// Every configured server with its runtime state, in insertion order.
    pub fn get_servers(&self) -> Vec<ServerView> {
        self.read().views()
    }

    pub fn get_server(&self, id: &str) -> Option<ServerView> {
        let registry = self.read();
        registry.config(id).map(|config| ServerView {
            config: config.clone(),
            state: registry.state(id),
        })
    }

    pub fn get_server_state(&self, id: &str) -> Option<ServerRuntimeState> {
        let registry = self.read();
        registry.config(id).map(|_| registry.state(id))
    }

    /// Connected, enabled servers with their live clients.
    fn live(&self) -> Vec<(ServerConfig, ServerRuntimeState, McpClient)> {
        let registry = self.read();
        registry
            .configs
            .iter()
            .filter(|c| c.enabled)
            .filter_map(|c| {
                let state = registry.state(&c.id);
                if state.status != ServerStatus::Connected {
                    return None;
                }
                let client = registry.clients.get(&c.id)?.clone();
                Some((c.clone(), state, client))
            })
            .collect()
    }

    /// Tools keyed `"{serverId}:{toolName}"`, recomputed on every call.
    pub fn get_available_tools(&self) -> BTreeMap<String, ToolHandle> {
        let mut tools = BTreeMap::new();
        for (config, state, client) in self.live() {
            for tool in state.tools {
                tools.insert(
                    format!("{}{TOOL_KEY_SEPARATOR}{}", config.id, tool.name),
                    ToolHandle {
                        server_id: config.id.clone(),
                        server_name: config.name.clone(),
                        name: tool.name,
                        description: tool.description,
                        input_schema: tool.input_schema,
                        client: client.clone(),
                    },
                );
            }
        }
        tools
    }

    pub fn get_available_resources(&self) -> Vec<Scoped<ResourceDescriptor>> {
        self.live()
            .into_iter()
            .flat_map(|(config, state, _)| {
                state.resources.into_iter().map(move |item| Scoped {
                    server_id: config.id.clone(),
                    server_name: config.name.clone(),
                    item,
                })
            })
            .collect()
    }

    pub fn get_available_prompts(&self) -> Vec<Scoped<PromptDescriptor>> {
        self.live()
            .into_iter()
            .flat_map(|(config, state, _)| {
                state.prompts.into_iter().map(move |item| Scoped {
                    server_id: config.id.clone(),
                    server_name: config.name.clone(),
                    item,
                })
            })
            .collect()
    }

    pub fn get_statistics(&self) -> McpStatistics {
        let registry = self.read();
        let mut stats = McpStatistics {
            total_servers: registry.configs.len(),
            ..McpStatistics::default()
        };
        for config in &registry.configs {
            let state = registry.state(&config.id);
            if config.enabled {
                stats.enabled_servers += 1;
            }
            match state.status {
                ServerStatus::Connected => stats.connected += 1,
                ServerStatus::Connecting => stats.connecting += 1,
                ServerStatus::Disconnected => stats.disconnected += 1,
                ServerStatus::Error => stats.errored += 1,
            }
            stats.total_tools += state.tools.len();
            stats.total_resources += state.resources.len();
            stats.total_prompts += state.prompts.len();
        }
        stats
    }

    // ── Routing helpers ─────────────────────────────────────────────────

    fn client(&self, id: &str) -> Result<McpClient, McpError> {
        let registry = self.read();
        if registry.config(id).is_none() {
            return Err(McpError::ServerNotFound(id.to_string()));
        }
        registry.clients.get(id).cloned().ok_or(McpError::ConnectionClosed)
    }

    pub async fn call_tool(&self, server_id: &str, tool: &str, arguments: Value) -> Result<Value, McpError> {
        let client = self.client(server_id)?;
        if client.is_ready() && !client.tools().iter().any(|t| t.name == tool) {
            return Err(McpError::ToolNotFound(format!("{server_id}{TOOL_KEY_SEPARATOR}{tool}")));
        }
        client.call_tool(tool, arguments).await
    }

    pub async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value, McpError> {
        self.client(server_id)?.read_resource(uri).await
    }

    pub async fn get_prompt(&self, server_id: &str, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.client(server_id)?.get_prompt(name, arguments).await
    }

    /// Connect a throwaway client, report what it discovered, close it.
    /// Touches no service state.
    pub async fn test_server_connection(&self, config: ServerConfig) -> ConnectionTestReport {
        let client = McpClient::new(config, self.inner.settings.clone(), self.inner.factory.clone());
        let report = match client.connect().await {
            Ok(()) => {
                let state = client.runtime_state();
                ConnectionTestReport {
                    success: true,
                    server_info: state.server_info,
                    tools: Some(state.tools),
                    resources: Some(state.resources),
                    prompts: Some(state.prompts),
                    error: None,
                }
            }
            Err(e) => ConnectionTestReport {
                success: false,
                server_info: None,
                tools: None,
                resources: None,
                prompts: None,
                error: Some(e.to_string()),
            },
        };
        client.close().await;
        report
    }

    // ── Observers ───────────────────────────────────────────────────────

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[ServerView]) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Snapshots of the full server list, one per change.
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.inner.events.subscribe()
    }

    fn notify(&self) {
        let snapshot = self.get_servers();
        let listeners: Vec<(ListenerId, Listener)> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::error!("MCP: listener {:?} panicked; continuing", id);
            }
        }
        let _ = self.inner.events.send(Arc::new(snapshot));
    }
}
