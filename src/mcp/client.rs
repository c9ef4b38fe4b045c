// Jaskier Shared Pattern -- mcp/client
//! One MCP client per configured server.
//!
//! Owns the transport, the pending-request table and the runtime-state
//! mirror for a single server, and drives the protocol state machine:
//!
//! ```text
//! Idle -> Connecting -> Initializing -> Ready <-> Degraded
//!                                          \          \
//!                                           `---------> Closed
//! ```
//!
//! Responses are correlated through a mutex-guarded table of oneshot
//! senders keyed by request id. A background reader task feeds inbound
//! frames to [`McpClient::handle_message`]; a health task pings the server
//! while Ready and hands failures to the reconnection controller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::codec::{self, Envelope, MessageKind, RequestId, RpcErrorObject};
use super::error::{ConnectErrorKind, McpError};
use super::transport::{InboundFrames, Transport, TransportFactory, truncate_str};
use super::types::{
    Capability, ClientPhase, PromptDescriptor, ResourceDescriptor, ServerConfig, ServerInfo,
    ServerRuntimeState, ServerStatus, ToolDescriptor,
};


/// Upper bound on `nextCursor` pages followed during one discovery pass.
const MAX_LIST_PAGES: usize = 32;

// ── Settings ────────────────────────────────────────────────────────────────

/// Timeouts and protocol constants for a client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub ping_timeout: Duration,
    pub health_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_attempts: 3,
            protocol_version: "2024-11-05".to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Receives every runtime-state change of a client, by value.
pub type StatePublisher = Arc<dyn Fn(ServerRuntimeState) + Send + Sync>;

type Outcome = Result<Value, McpError>;
type PendingTable = Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>;

// ── Internals ───────────────────────────────────────────────────────────────

struct Core {
    phase: ClientPhase,
    state: ServerRuntimeState,
}

struct ClientInner {
    config: ServerConfig,
    settings: ClientSettings,
    factory: Arc<dyn TransportFactory>,
    publisher: Option<StatePublisher>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    pending: PendingTable,
    next_id: AtomicU64,
    core: Mutex<Core>,
    /// Cancelled by `close()`; parent of every per-connection token.
    shutdown: CancellationToken,
    /// Reader and health tasks of the current connection.
    session: Mutex<CancellationToken>,
    epoch: AtomicU64,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    discovery: tokio::sync::Mutex<()>,
}

/// Removes a pending entry when the waiting future completes or is dropped.
struct PendingSlot<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn status_for(phase: ClientPhase, last_error: Option<&String>) -> ServerStatus {
    match phase {
        ClientPhase::Ready => ServerStatus::Connected,
        ClientPhase::Connecting | ClientPhase::Initializing | ClientPhase::Degraded => ServerStatus::Connecting,
        ClientPhase::Idle => ServerStatus::Disconnected,
        ClientPhase::Closed if last_error.is_some() => ServerStatus::Error,
        ClientPhase::Closed => ServerStatus::Disconnected,
    }
}

// ── Client ──────────────────────────────────────────────────────────────────

/// Handle to one server connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl McpClient {
    pub fn new(config: ServerConfig, settings: ClientSettings, factory: Arc<dyn TransportFactory>) -> Self {
        Self::build(config, settings, factory, None)
    }

    /// Like [`new`](Self::new), publishing every state change to `publisher`.
    pub fn with_publisher(
        config: ServerConfig,
        settings: ClientSettings,
        factory: Arc<dyn TransportFactory>,
        publisher: StatePublisher,
    ) -> Self {
        Self::build(config, settings, factory, Some(publisher))
    }

    fn build(
        config: ServerConfig,
        settings: ClientSettings,
        factory: Arc<dyn TransportFactory>,
        publisher: Option<StatePublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                settings,
                factory,
                publisher,
                transport: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                core: Mutex::new(Core {
                    phase: ClientPhase::Idle,
                    state: ServerRuntimeState::default(),
                }),
                shutdown: CancellationToken::new(),
                session: Mutex::new(CancellationToken::new()),
                epoch: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                discovery: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn from_weak(weak: &Weak<ClientInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn phase(&self) -> ClientPhase {
        lock(&self.inner.core).phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == ClientPhase::Ready
    }

    /// Snapshot of the runtime-state mirror.
    pub fn runtime_state(&self) -> ServerRuntimeState {
        lock(&self.inner.core).state.clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.inner.core).state.server_info.clone()
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        lock(&self.inner.core).state.tools.clone()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Whether both handles drive the same connection.
    pub fn ptr_eq(&self, other: &McpClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── State transitions ───────────────────────────────────────────────

    /// Move to `phase` and publish. A closed client stays Closed.
    fn transition(&self, phase: ClientPhase, error: Option<String>) {
        {
            let mut core = lock(&self.inner.core);
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            core.phase = phase;
            if error.is_some() {
                core.state.last_error = error;
            }
            core.state.status = status_for(phase, core.state.last_error.as_ref());
        }
        self.publish();
    }

    fn update_state(&self, f: impl FnOnce(&mut ServerRuntimeState)) {
        f(&mut lock(&self.inner.core).state);
        self.publish();
    }

    fn publish(&self) {
        let snapshot = {
            let mut core = lock(&self.inner.core);
            core.state.revision += 1;
            core.state.clone()
        };
        if let Some(publisher) = &self.inner.publisher {
            publisher(snapshot);
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.inner.transport).clone()
    }

    // ── Connect ─────────────────────────────────────────────────────────

    /// Open the transport, run the `initialize` handshake and discovery.
    /// The whole attempt is bounded by `connect_timeout`; on any failure the
    /// client ends up Closed with the error recorded in `last_error`.
    pub async fn connect(&self) -> Result<(), McpError> {
        match self.phase() {
            ClientPhase::Idle => {}
            ClientPhase::Ready => return Ok(()),
            ClientPhase::Closed => return Err(McpError::ConnectionClosed),
            phase => return Err(McpError::NotReady(phase)),
        }

        let name = &self.inner.config.name;
        tracing::info!("MCP: connecting to '{}' at {}", name, self.inner.config.url);
        match self.establish(false).await {
            Ok(()) => {
                let state = self.runtime_state();
                tracing::info!(
                    "MCP: connected to '{}' ({} tools, {} resources, {} prompts)",
                    name,
                    state.tools.len(),
                    state.resources.len(),
                    state.prompts.len()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("MCP: failed to connect to '{}': {}", name, e);
                if self.inner.closed.load(Ordering::SeqCst) {
                    self.mark_closed();
                    return Err(e);
                }
                {
                    let mut core = lock(&self.inner.core);
                    core.state.clear_discovery();
                    core.state.server_info = None;
                }
                self.transition(ClientPhase::Closed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// One connection attempt. Leaves no transport behind on failure.
    async fn establish(&self, reconnecting: bool) -> Result<(), McpError> {
        let settings = &self.inner.settings;
        let session = {
            let mut session = lock(&self.inner.session);
            session.cancel();
            *session = self.inner.shutdown.child_token();
            session.clone()
        };
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if !reconnecting {
            self.transition(ClientPhase::Connecting, None);
        }

        let transport: Arc<dyn Transport> = match self.inner.factory.create(&self.inner.config) {
            Ok(transport) => Arc::from(transport),
            Err(e) => return Err(e.into()),
        };
        *lock(&self.inner.transport) = Some(transport.clone());

        let mut opened = false;
        let attempt = async {
            let frames = transport
                .connect(&self.inner.config.url, &self.inner.config.headers)
                .await?;
            opened = true;
            self.spawn_reader(frames, session.clone(), epoch);
            if !reconnecting {
                self.transition(ClientPhase::Initializing, None);
            }
            self.handshake().await?;
            self.transition(ClientPhase::Ready, None);
            self.discover().await?;
            Ok::<(), McpError>(())
        };
        let timed = tokio::time::timeout(settings.connect_timeout, attempt).await;
        let outcome = match timed {
            Ok(result) => result,
            Err(_) if opened => Err(McpError::HandshakeTimeout(settings.connect_timeout)),
            Err(_) => Err(McpError::Connect {
                kind: ConnectErrorKind::Timeout,
                message: format!(
                    "no connection to '{}' within {}s",
                    self.inner.config.url,
                    settings.connect_timeout.as_secs_f32()
                ),
            }),
        };

        let outcome = match outcome {
            Ok(()) if self.inner.shutdown.is_cancelled() => Err(McpError::ConnectionClosed),
            other => other,
        };
        match outcome {
            Ok(()) => {
                self.update_state(|state| {
                    state.last_connected_at = Some(chrono::Utc::now());
                    state.last_error = None;
                    state.reconnect_attempts = 0;
                    state.status = ServerStatus::Connected;
                });
                self.spawn_health(session);
                Ok(())
            }
            Err(e) => {
                self.drop_connection(McpError::ConnectionClosed).await;
                // close() may have taken the slot while this attempt still held its own handle.
                transport.close().await;
                if reconnecting {
                    self.transition(ClientPhase::Degraded, None);
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(), McpError> {
        let settings = &self.inner.settings;
        let result = self
            .send_request(
                "initialize",
                json!({
                    "protocolVersion": settings.protocol_version,
                    "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
                    "clientInfo": {
                        "name": settings.client_name,
                        "version": settings.client_version
                    }
                }),
            )
            .await?;

        let capabilities = result
            .get("capabilities")
            .filter(|c| c.is_object())
            .ok_or_else(|| McpError::ProtocolMismatch("initialize result has no capabilities object".into()))?;
        match result.get("protocolVersion") {
            Some(Value::String(v)) if *v != settings.protocol_version => {
                tracing::warn!(
                    "MCP: '{}' speaks protocol {} (requested {})",
                    self.inner.config.name,
                    v,
                    settings.protocol_version
                );
            }
            Some(Value::String(_)) | None => {}
            Some(other) => {
                return Err(McpError::ProtocolMismatch(format!("protocolVersion is not a string: {other}")));
            }
        }

        let negotiated = Capability::parse_advertised(capabilities);
        let server_info = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value::<ServerInfo>(v.clone()).ok());
        tracing::debug!(
            "MCP: initialized '{}' (server: {}, capabilities: {:?})",
            self.inner.config.name,
            server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            negotiated
        );
        {
            let mut core = lock(&self.inner.core);
            core.state.capabilities = negotiated;
            core.state.server_info = server_info;
        }

        self.send_notification("notifications/initialized", json!({})).await;
        Ok(())
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// Re-fetch every negotiated list and replace the descriptors.
    /// Runs are serialized; an RPC error on one list leaves it empty.
    pub async fn discover(&self) -> Result<(), McpError> {
        let _running = self.inner.discovery.lock().await;
        let capabilities = lock(&self.inner.core).state.capabilities.clone();

        let mut tools = Vec::new();
        let mut resources = Vec::new();
        let mut prompts = Vec::new();
        for cap in capabilities {
            let outcome = match cap {
                Capability::Tools => self.list_all::<ToolDescriptor>(cap, "tools").await.map(|v| tools = v),
                Capability::Resources => self
                    .list_all::<ResourceDescriptor>(cap, "resources")
                    .await
                    .map(|v| resources = v),
                Capability::Prompts => self.list_all::<PromptDescriptor>(cap, "prompts").await.map(|v| prompts = v),
            };
            match outcome {
                Ok(()) => {}
                Err(e @ McpError::Rpc { .. }) => {
                    tracing::warn!("MCP: '{}' failed {}: {}", self.inner.config.name, cap.list_method(), e);
                }
                Err(e) => return Err(e),
            }
        }

        self.update_state(|state| {
            state.tools = tools;
            state.resources = resources;
            state.prompts = prompts;
        });
        Ok(())
    }

    async fn list_all<T: DeserializeOwned>(&self, cap: Capability, key: &str) -> Result<Vec<T>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page = self.send_request(cap.list_method(), params).await?;
            for raw in page.get(key).and_then(Value::as_array).into_iter().flatten() {
                match serde_json::from_value::<T>(raw.clone()) {
                    Ok(item) => items.push(item),
                    Err(e) => tracing::warn!(
                        "MCP: skipping malformed {} entry from '{}': {}",
                        key,
                        self.inner.config.name,
                        e
                    ),
                }
            }
            cursor = page.get("nextCursor").and_then(Value::as_str).map(String::from);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Send a request and await its response, bounded by `request_timeout`.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        self.request_with_timeout(method, params, self.inner.settings.request_timeout)
            .await
    }

    async fn request_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, McpError> {
        let transport = self.current_transport().ok_or(McpError::ConnectionClosed)?;
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst) as i64);
        let frame = codec::encode(&Envelope::request(id.clone(), method, params)?)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);
        let _slot = PendingSlot {
            table: &self.inner.pending,
            id: id.clone(),
        };

        tracing::debug!(server = %self.inner.config.name, id = %id, method = %method, "MCP: -> request");
        transport.send(frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(
                    "MCP: '{}' request {} ({}) timed out after {:?}",
                    self.inner.config.name,
                    id,
                    method,
                    timeout
                );
                Err(McpError::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget; failures are only logged.
    pub async fn send_notification(&self, method: &str, params: Value) {
        let Some(transport) = self.current_transport() else {
            tracing::debug!("MCP: no transport for notification {}", method);
            return;
        };
        let frame = match Envelope::notification(method, params).and_then(|e| codec::encode(&e)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("MCP: cannot encode notification {}: {}", method, e);
                return;
            }
        };
        if let Err(e) = transport.send(frame).await {
            tracing::warn!("MCP: notification {} to '{}' failed: {}", method, self.inner.config.name, e);
        }
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.request_with_timeout("ping", json!({}), self.inner.settings.ping_timeout)
            .await
            .map(|_| ())
    }

    fn require(&self, cap: Capability) -> Result<(), McpError> {
        let core = lock(&self.inner.core);
        match core.phase {
            ClientPhase::Ready if core.state.capabilities.contains(&cap) => Ok(()),
            ClientPhase::Ready => Err(McpError::UnsupportedCapability(cap)),
            ClientPhase::Idle | ClientPhase::Closed => Err(McpError::ConnectionClosed),
            phase => Err(McpError::NotReady(phase)),
        }
    }

    /// `tools/call`; the raw result object is returned as-is.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.require(Capability::Tools)?;
        self.send_request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.require(Capability::Resources)?;
        self.send_request("resources/read", json!({ "uri": uri })).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.require(Capability::Prompts)?;
        self.send_request("prompts/get", json!({ "name": name, "arguments": arguments }))
            .await
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    fn on_frame(&self, frame: &str) {
        match codec::decode(frame) {
            Ok(envelope) => self.handle_message(envelope),
            Err(e) => tracing::warn!(
                "MCP: dropping malformed frame from '{}': {} ({})",
                self.inner.config.name,
                e,
                truncate_str(frame, 200)
            ),
        }
    }

    /// Route one inbound message: resolve a pending request, react to a
    /// notification or answer a server-initiated request.
    pub fn handle_message(&self, envelope: Envelope) {
        match envelope.kind() {
            MessageKind::Response => self.resolve(envelope),
            MessageKind::Notification => {
                let method = envelope.method.as_deref().unwrap_or_default();
                match Capability::from_list_changed(method) {
                    Some(cap) => {
                        tracing::info!("MCP: '{}' reports {} list changed", self.inner.config.name, cap);
                        let client = self.clone();
                        tokio::spawn(async move {
                            if !client.is_ready() {
                                return;
                            }
                            if let Err(e) = client.discover().await {
                                tracing::warn!("MCP: rediscovery on '{}' failed: {}", client.inner.config.name, e);
                            }
                        });
                    }
                    None => tracing::debug!("MCP: ignoring notification {} from '{}'", method, self.inner.config.name),
                }
            }
            MessageKind::Request => {
                let client = self.clone();
                tokio::spawn(async move { client.answer(envelope).await });
            }
            MessageKind::Invalid => {
                tracing::warn!("MCP: dropping message with neither id nor method from '{}'", self.inner.config.name);
            }
        }
    }

    fn resolve(&self, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return;
        };
        let Some(waiter) = lock(&self.inner.pending).remove(&id) else {
            tracing::warn!(
                "MCP: dropping response for unknown or expired request {} from '{}'",
                id,
                self.inner.config.name
            );
            return;
        };
        tracing::debug!(server = %self.inner.config.name, id = %id, "MCP: <- response");
        let outcome = match envelope.error {
            Some(RpcErrorObject { code, message, data }) => Err(McpError::Rpc { code, message, data }),
            None => Ok(envelope.result.unwrap_or(Value::Null)),
        };
        let _ = waiter.send(outcome);
    }

    async fn answer(&self, request: Envelope) {
        let (Some(id), Some(method)) = (request.id, request.method) else {
            return;
        };
        let reply = if method == "ping" {
            Envelope::success(id.clone(), json!({}))
                .unwrap_or_else(|_| Envelope::failure(id, RpcErrorObject::method_not_found(&method)))
        } else {
            tracing::debug!("MCP: rejecting server request {} from '{}'", method, self.inner.config.name);
            Envelope::failure(id, RpcErrorObject::method_not_found(&method))
        };
        let Some(transport) = self.current_transport() else {
            return;
        };
        match codec::encode(&reply) {
            Ok(frame) => {
                if let Err(e) = transport.send(frame).await {
                    tracing::warn!("MCP: reply to '{}' failed: {}", self.inner.config.name, e);
                }
            }
            Err(e) => tracing::warn!("MCP: cannot encode reply: {}", e),
        }
    }

    fn fail_pending(&self, error: McpError) {
        let waiters: Vec<_> = lock(&self.inner.pending).drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    // ── Background tasks ────────────────────────────────────────────────

    fn spawn_reader(&self, mut frames: InboundFrames, session: CancellationToken, epoch: u64) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = session.cancelled() => return,
                    frame = frames.recv() => frame,
                };
                let Some(client) = McpClient::from_weak(&weak) else {
                    return;
                };
                match frame {
                    Some(frame) => client.on_frame(&frame),
                    None => {
                        if client.inner.epoch.load(Ordering::SeqCst) == epoch {
                            client.on_stream_end();
                        }
                        return;
                    }
                }
            }
        });
    }

    fn on_stream_end(&self) {
        tracing::warn!("MCP: inbound stream from '{}' ended", self.inner.config.name);
        self.fail_pending(McpError::ConnectionClosed);
        if self.is_ready() {
            self.connection_lost("inbound stream ended".to_string());
        }
    }

    fn spawn_health(&self, session: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.health_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(client) = McpClient::from_weak(&weak) else {
                    return;
                };
                if !client.is_ready() {
                    continue;
                }
                if let Err(e) = client.ping().await {
                    if session.is_cancelled() {
                        return;
                    }
                    tracing::warn!("MCP: health check on '{}' failed: {}", client.inner.config.name, e);
                    client.connection_lost(format!("health check failed: {e}"));
                    return;
                }
            }
        });
    }

    /// Ready -> Degraded, then hand over to the reconnection controller.
    fn connection_lost(&self, reason: String) {
        {
            let mut core = lock(&self.inner.core);
            if core.phase != ClientPhase::Ready {
                return;
            }
            core.phase = ClientPhase::Degraded;
            core.state.status = status_for(ClientPhase::Degraded, None);
            core.state.last_error = Some(reason);
        }
        self.publish();
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect().await;
            client.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Linear backoff (`base * attempt`), bounded by `reconnect_max_attempts`.
    async fn reconnect(&self) {
        let name = self.inner.config.name.clone();
        let base = self.inner.settings.reconnect_base_delay;
        let max_attempts = self.inner.settings.reconnect_max_attempts;
        self.drop_connection(McpError::ConnectionClosed).await;

        for attempt in 1..=max_attempts {
            self.update_state(|state| state.reconnect_attempts = attempt);
            let delay = base * attempt;
            tracing::info!("MCP: reconnecting to '{}' in {:?} (attempt {}/{})", name, delay, attempt, max_attempts);
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.establish(true).await {
                Ok(()) => {
                    tracing::info!("MCP: reconnected to '{}' after {} attempt(s)", name, attempt);
                    return;
                }
                Err(McpError::ConnectionClosed) if self.inner.shutdown.is_cancelled() => return,
                Err(e) => {
                    tracing::warn!("MCP: reconnect attempt {} to '{}' failed: {}", attempt, name, e);
                    self.update_state(|state| state.last_error = Some(e.to_string()));
                }
            }
        }

        let exhausted = McpError::ReconnectionExhausted(max_attempts);
        tracing::error!("MCP: giving up on '{}': {}", name, exhausted);
        {
            let mut core = lock(&self.inner.core);
            core.state.clear_discovery();
        }
        self.transition(ClientPhase::Closed, Some(exhausted.to_string()));
    }

    /// Stop the connection's tasks, fail its pending requests and close the transport.
    async fn drop_connection(&self, error: McpError) {
        lock(&self.inner.session).cancel();
        let transport = lock(&self.inner.transport).take();
        self.fail_pending(error);
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    // ── Close ───────────────────────────────────────────────────────────

    /// Cancel health and reconnection, fail pending requests with
    /// `ConnectionClosed` and close the transport. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        self.drop_connection(McpError::ConnectionClosed).await;
        self.mark_closed();
        tracing::info!("MCP: disconnected '{}'", self.inner.config.name);
    }

    /// Force the Closed/disconnected mirror, whatever an in-flight attempt wrote.
    fn mark_closed(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.phase = ClientPhase::Closed;
            core.state.status = ServerStatus::Disconnected;
            core.state.clear_discovery();
            core.state.reconnect_attempts = 0;
        }
        self.publish();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
