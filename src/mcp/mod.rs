// Jaskier Shared Pattern -- mcp
//! MCP (Model Context Protocol) client service.
//!
//! **Codec** (`codec`): JSON-RPC 2.0 envelopes, pure encode/decode.
//!
//! **Transports** (`transport`): SSE + HTTP POST, WebSocket and an in-process
//! loopback, selected by URL scheme.
//!
//! **Client** (`McpClient`): one per server. Handshake, discovery, request
//! correlation, health checks and bounded reconnection.
//!
//! **Service** (`McpService`): registry of configured servers, persistence
//! through a `ConfigStore`, listeners and the aggregated tool namespace.
//!
//! **Adapter** (`ToolInvocationAdapter`): discovered tools as
//! function-calling declarations, and calls routed back by name.
//!
//! Protocol reference: <https://spec.modelcontextprotocol.io/2024-11-05/>

pub mod adapter;
pub mod client;
pub mod codec;
pub mod error;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;

pub use adapter::{FunctionDeclaration, ToolInvocationAdapter};
pub use client::{ClientSettings, McpClient};
pub use error::{ConnectErrorKind, McpError, TransportError};
pub use service::{ConnectionTestReport, ListenerId, McpService, McpStatistics, ToolHandle};
pub use store::{ConfigStore, JsonFileStore, MemoryStore};
pub use transport::{DefaultTransportFactory, LoopbackFactory, LoopbackServer, TransportFactory};
pub use types::{ServerConfig, ServerConfigPatch, ServerRuntimeState, ServerStatus, ServerView};
