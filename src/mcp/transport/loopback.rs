// Jaskier Shared Pattern -- mcp/transport/loopback
//! In-process MCP server and the transport that talks to it.
//!
//! `LoopbackServer` answers the same methods a remote server would
//! (`initialize`, `ping`, `tools/*`, `resources/*`, `prompts/*`) from a
//! script that can be changed at runtime: tools can be swapped and
//! announced with `list_changed`, pings can be made to fail, connects can
//! be refused, and responses can be held back and released in any order.
//! It is used to embed servers in the same process and to drive the client
//! through failure scenarios in tests. The fault-injection controls are only
//! compiled for unit tests or with the `test-helpers` feature.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{InboundFrames, Transport, TransportFactory};
use crate::mcp::codec::{self, Envelope, RpcErrorObject, error_codes};
use crate::mcp::error::{ConnectErrorKind, TransportError};
use crate::mcp::types::{PromptDescriptor, ResourceDescriptor, ServerConfig, ToolDescriptor};

type ToolHandler = Arc<dyn Fn(&str, &Value) -> Result<Value, RpcErrorObject> + Send + Sync>;

/// Sentinel for "fail every ping from now on".
const ALWAYS: u32 = u32::MAX;

struct Script {
    protocol_version: String,
    capabilities: Value,
    server_name: String,
    tools: Vec<ToolDescriptor>,
    resources: Vec<(ResourceDescriptor, String)>,
    prompts: Vec<PromptDescriptor>,
    tool_handler: Option<ToolHandler>,
    refuse_connects: u32,
    failing_pings: u32,
    held_methods: HashSet<String>,
    duplicate_responses: bool,
}

struct ServerInner {
    script: Mutex<Script>,
    received: Mutex<Vec<Envelope>>,
    peers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    held: Mutex<Vec<(mpsc::WeakUnboundedSender<String>, String)>>,
    connects: AtomicU32,
}

#[derive(Clone)]
pub struct LoopbackServer {
    inner: Arc<ServerInner>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackServer {
    /// A server advertising all three capabilities with empty lists.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                script: Mutex::new(Script {
                    protocol_version: "2024-11-05".to_string(),
                    capabilities: json!({
                        "tools": { "listChanged": true },
                        "resources": { "subscribe": false, "listChanged": true },
                        "prompts": { "listChanged": true }
                    }),
                    server_name: "loopback".to_string(),
                    tools: Vec::new(),
                    resources: Vec::new(),
                    prompts: Vec::new(),
                    tool_handler: None,
                    refuse_connects: 0,
                    failing_pings: 0,
                    held_methods: HashSet::new(),
                    duplicate_responses: false,
                }),
                received: Mutex::new(Vec::new()),
                peers: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
                connects: AtomicU32::new(0),
            }),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.inner.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Builder-style setup ─────────────────────────────────────────────

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.script().server_name = name.into();
        self
    }

    /// Replace the advertised `capabilities` object.
    pub fn with_capabilities(self, capabilities: Value) -> Self {
        self.script().capabilities = capabilities;
        self
    }

    pub fn with_tool(self, tool: ToolDescriptor) -> Self {
        self.script().tools.push(tool);
        self
    }

    pub fn with_resource(self, resource: ResourceDescriptor, text: impl Into<String>) -> Self {
        self.script().resources.push((resource, text.into()));
        self
    }

    pub fn with_prompt(self, prompt: PromptDescriptor) -> Self {
        self.script().prompts.push(prompt);
        self
    }

    /// Handle `tools/call`. Without a handler, calls to known tools echo
    /// their arguments back as a text content part.
    pub fn on_tool_call<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, RpcErrorObject> + Send + Sync + 'static,
    {
        self.script().tool_handler = Some(Arc::new(handler));
        self
    }

    // ── Runtime controls ────────────────────────────────────────────────

    /// Swap the tool list. Peers only learn about it after [`notify`](Self::notify).
    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        self.script().tools = tools;
    }

    /// Push a notification to every connected peer.
    pub fn notify(&self, method: &str) {
        let Ok(envelope) = Envelope::notification(method, json!({})) else {
            return;
        };
        let Ok(frame) = codec::encode(&envelope) else {
            return;
        };
        let mut peers = self.inner.peers.lock().unwrap_or_else(|p| p.into_inner());
        peers.retain(|tx| tx.send(frame.clone()).is_ok());
    }

    // ── Observation ─────────────────────────────────────────────────────

    pub fn received(&self) -> Vec<Envelope> {
        self.inner.received.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received().into_iter().filter_map(|e| e.method).collect()
    }

    pub fn count_received(&self, method: &str) -> usize {
        self.received_methods().iter().filter(|m| *m == method).count()
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        let mut peers = self.inner.peers.lock().unwrap_or_else(|p| p.into_inner());
        peers.retain(|tx| !tx.is_closed());
        peers.len()
    }
}

/// Fault injection, for driving clients through failure paths.
#[cfg(any(test, feature = "test-helpers"))]
impl LoopbackServer {
    pub fn refuse_next_connects(&self, n: u32) {
        self.script().refuse_connects = n;
    }

    pub fn fail_next_pings(&self, n: u32) {
        self.script().failing_pings = n;
    }

    pub fn fail_all_pings(&self) {
        self.script().failing_pings = ALWAYS;
    }

    /// Hold responses to `method` until [`release_held`](Self::release_held).
    pub fn hold_responses(&self, method: &str) {
        self.script().held_methods.insert(method.to_string());
    }

    /// Send every response twice.
    pub fn duplicate_responses(&self, on: bool) {
        self.script().duplicate_responses = on;
    }

    /// Deliver held responses, optionally newest first. Returns how many went out.
    pub fn release_held(&self, newest_first: bool) -> usize {
        let mut held: Vec<_> = std::mem::take(&mut *self.inner.held.lock().unwrap_or_else(|p| p.into_inner()));
        self.script().held_methods.clear();
        if newest_first {
            held.reverse();
        }
        let mut delivered = 0;
        for (peer, frame) in held {
            if let Some(tx) = peer.upgrade() {
                if tx.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn held_count(&self) -> usize {
        self.inner.held.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Push a raw frame (possibly malformed) to every connected peer.
    pub fn push_raw(&self, frame: &str) {
        let mut peers = self.inner.peers.lock().unwrap_or_else(|p| p.into_inner());
        peers.retain(|tx| tx.send(frame.to_string()).is_ok());
    }

    /// End every peer's inbound stream, as if the server went away.
    pub fn drop_peers(&self) {
        self.inner.peers.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl LoopbackServer {
    // ── Wire handling ───────────────────────────────────────────────────

    fn accept(&self) -> Result<(mpsc::WeakUnboundedSender<String>, InboundFrames), TransportError> {
        {
            let mut script = self.script();
            if script.refuse_connects > 0 {
                script.refuse_connects -= 1;
                return Err(TransportError::connect(ConnectErrorKind::Refused, "loopback server refused the connection"));
            }
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();
        self.inner.peers.lock().unwrap_or_else(|p| p.into_inner()).push(tx);
        Ok((weak, rx))
    }

    fn detach(&self, peer: &mpsc::WeakUnboundedSender<String>) {
        if let Some(tx) = peer.upgrade() {
            self.inner
                .peers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|p| !p.same_channel(&tx));
        }
    }

    fn deliver(&self, envelope: Envelope, peer: &mpsc::WeakUnboundedSender<String>) {
        let method = envelope.method.clone();
        let Some(response) = self.handle(envelope) else {
            return;
        };
        let frame = match codec::encode(&response) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("MCP loopback: cannot encode response: {}", e);
                return;
            }
        };
        let (held, duplicate) = {
            let script = self.script();
            let held = method.as_deref().is_some_and(|m| script.held_methods.contains(m));
            (held, script.duplicate_responses)
        };
        if held {
            self.inner
                .held
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((peer.clone(), frame));
            return;
        }
        if let Some(tx) = peer.upgrade() {
            if duplicate {
                let _ = tx.send(frame.clone());
            }
            let _ = tx.send(frame);
        }
    }

    /// Route one inbound message. Returns the response for requests.
    pub fn handle(&self, envelope: Envelope) -> Option<Envelope> {
        self.inner
            .received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(envelope.clone());

        let method = envelope.method.as_deref()?;
        let id = envelope.id.clone()?;
        let params = envelope.params.clone().unwrap_or_else(|| json!({}));
        tracing::debug!(method = %method, "MCP loopback: incoming request");

        let result = match method {
            "initialize" => Ok(self.handle_initialize()),
            "ping" => self.handle_ping(),
            "tools/list" => Ok(json!({ "tools": self.script().tools })),
            "tools/call" => self.handle_tools_call(&params),
            "resources/list" => {
                let resources: Vec<ResourceDescriptor> =
                    self.script().resources.iter().map(|(r, _)| r.clone()).collect();
                Ok(json!({ "resources": resources }))
            }
            "resources/read" => self.handle_resources_read(&params),
            "prompts/list" => Ok(json!({ "prompts": self.script().prompts })),
            "prompts/get" => self.handle_prompts_get(&params),
            other => Err(RpcErrorObject::method_not_found(other)),
        };

        Some(match result {
            Ok(value) => Envelope::success(id.clone(), value).unwrap_or_else(|e| {
                Envelope::failure(id, RpcErrorObject::new(error_codes::INTERNAL_ERROR, e.to_string()))
            }),
            Err(error) => Envelope::failure(id, error),
        })
    }

    fn handle_initialize(&self) -> Value {
        let script = self.script();
        json!({
            "protocolVersion": script.protocol_version,
            "capabilities": script.capabilities,
            "serverInfo": { "name": script.server_name, "version": "1.0.0" }
        })
    }

    fn handle_ping(&self) -> Result<Value, RpcErrorObject> {
        let mut script = self.script();
        if script.failing_pings > 0 {
            if script.failing_pings != ALWAYS {
                script.failing_pings -= 1;
            }
            return Err(RpcErrorObject::new(-32000, "server unhealthy"));
        }
        Ok(json!({}))
    }

    fn handle_tools_call(&self, params: &Value) -> Result<Value, RpcErrorObject> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        if name.is_empty() {
            return Err(RpcErrorObject::invalid_params("missing 'name'"));
        }
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let (known, handler) = {
            let script = self.script();
            (script.tools.iter().any(|t| t.name == name), script.tool_handler.clone())
        };
        if !known {
            return Err(RpcErrorObject::invalid_params(&format!("unknown tool '{name}'")));
        }
        match handler {
            Some(handler) => handler(name, &arguments),
            None => Ok(json!({
                "content": [{ "type": "text", "text": arguments.to_string() }],
                "isError": false
            })),
        }
    }

    fn handle_resources_read(&self, params: &Value) -> Result<Value, RpcErrorObject> {
        let uri = params.get("uri").and_then(Value::as_str).unwrap_or("");
        let script = self.script();
        let (resource, text) = script
            .resources
            .iter()
            .find(|(r, _)| r.uri == uri)
            .ok_or_else(|| RpcErrorObject::invalid_params(&format!("unknown resource URI: {uri}")))?;
        Ok(json!({
            "contents": [{
                "uri": resource.uri,
                "mimeType": resource.mime_type.clone().unwrap_or_else(|| "text/plain".to_string()),
                "text": text
            }]
        }))
    }

    fn handle_prompts_get(&self, params: &Value) -> Result<Value, RpcErrorObject> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let script = self.script();
        let prompt = script
            .prompts
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| RpcErrorObject::invalid_params(&format!("unknown prompt '{name}'")))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        Ok(json!({
            "description": prompt.description,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": format!("{} {}", prompt.name, arguments) }
            }]
        }))
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

pub struct LoopbackTransport {
    server: LoopbackServer,
    peer: Mutex<Option<mpsc::WeakUnboundedSender<String>>>,
}

impl LoopbackTransport {
    pub fn new(server: LoopbackServer) -> Self {
        Self {
            server,
            peer: Mutex::new(None),
        }
    }

    fn peer(&self) -> Option<mpsc::WeakUnboundedSender<String>> {
        self.peer.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        _url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<InboundFrames, TransportError> {
        let (peer, rx) = self.server.accept()?;
        *self.peer.lock().unwrap_or_else(|p| p.into_inner()) = Some(peer);
        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let peer = self.peer().ok_or(TransportError::Closed)?;
        if peer.upgrade().is_none() {
            return Err(TransportError::Send("loopback peer is gone".to_string()));
        }
        let envelope = codec::decode(&frame).map_err(|e| TransportError::Send(e.to_string()))?;
        self.server.deliver(envelope, &peer);
        Ok(())
    }

    async fn close(&self) {
        if let Some(peer) = self.peer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            self.server.detach(&peer);
        }
    }
}

/// Maps `loopback://{name}` URLs to registered servers. A fallback server,
/// when set, answers every URL regardless of scheme.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    servers: Arc<RwLock<HashMap<String, LoopbackServer>>>,
    fallback: Option<LoopbackServer>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every URL to `server`.
    pub fn single(server: LoopbackServer) -> Self {
        Self {
            servers: Arc::default(),
            fallback: Some(server),
        }
    }

    pub fn register(&self, name: impl Into<String>, server: LoopbackServer) {
        self.servers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), server);
    }

    fn lookup(&self, raw_url: &str) -> Option<LoopbackServer> {
        let host = url::Url::parse(raw_url)
            .ok()
            .filter(|u| u.scheme() == "loopback")
            .and_then(|u| u.host_str().map(str::to_string));
        host.and_then(|h| {
            self.servers
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(&h)
                .cloned()
        })
        .or_else(|| self.fallback.clone())
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, TransportError> {
        self.lookup(&config.url)
            .map(|server| Box::new(LoopbackTransport::new(server)) as Box<dyn Transport>)
            .ok_or_else(|| {
                TransportError::connect(
                    ConnectErrorKind::Refused,
                    format!("no in-process server registered for '{}'", config.url),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: i64, method: &str, params: Value) -> Envelope {
        Envelope::request(id, method, params).unwrap()
    }

    #[test]
    fn answers_initialize_with_capabilities() {
        let server = LoopbackServer::new()
            .with_name("alpha")
            .with_capabilities(json!({ "tools": {} }));
        let resp = server.handle(request(1, "initialize", json!({}))).unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "alpha");
        assert_eq!(result["capabilities"], json!({ "tools": {} }));
    }

    #[test]
    fn notifications_get_no_response() {
        let server = LoopbackServer::new();
        let note = Envelope::notification("notifications/initialized", json!({})).unwrap();
        assert!(server.handle(note).is_none());
        assert_eq!(server.received_methods(), vec!["notifications/initialized"]);
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let server = LoopbackServer::new();
        let resp = server.handle(request(3, "sampling/createMessage", json!({}))).unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn ping_failures_count_down() {
        let server = LoopbackServer::new();
        server.fail_next_pings(1);
        assert!(server.handle(request(1, "ping", json!({}))).unwrap().error.is_some());
        assert!(server.handle(request(2, "ping", json!({}))).unwrap().error.is_none());
    }

    #[test]
    fn tools_call_echoes_known_tools_only() {
        let server = LoopbackServer::new().with_tool(ToolDescriptor {
            name: "echo".into(),
            description: None,
            input_schema: json!({ "type": "object" }),
        });
        let ok = server
            .handle(request(1, "tools/call", json!({ "name": "echo", "arguments": { "text": "hi" } })))
            .unwrap();
        assert_eq!(ok.result.unwrap()["content"][0]["text"], r#"{"text":"hi"}"#);

        let missing = server
            .handle(request(2, "tools/call", json!({ "name": "nope" })))
            .unwrap();
        assert_eq!(missing.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn refused_connects_are_counted_down() {
        let server = LoopbackServer::new();
        server.refuse_next_connects(1);
        let transport = LoopbackTransport::new(server.clone());
        assert!(transport.connect("loopback://x", &HashMap::new()).await.is_err());
        assert!(transport.connect("loopback://x", &HashMap::new()).await.is_ok());
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn drop_peers_ends_the_inbound_stream() {
        let server = LoopbackServer::new();
        let transport = LoopbackTransport::new(server.clone());
        let mut rx = transport.connect("loopback://x", &HashMap::new()).await.unwrap();
        server.drop_peers();
        assert!(rx.recv().await.is_none());
        assert!(transport.send("{}".into()).await.is_err());
    }

    #[test]
    fn factory_routes_by_host_and_fallback() {
        let factory = LoopbackFactory::new();
        factory.register("alpha", LoopbackServer::new());
        assert!(factory.create(&ServerConfig::new("a", "A", "loopback://alpha")).is_ok());
        assert!(factory.create(&ServerConfig::new("b", "B", "loopback://beta")).is_err());

        let single = LoopbackFactory::single(LoopbackServer::new());
        assert!(single.create(&ServerConfig::new("c", "C", "wss://example/mcp")).is_ok());
    }
}
