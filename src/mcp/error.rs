// Jaskier Shared Pattern -- mcp/error
//! Error taxonomy shared by the codec, transports, clients and the registry.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::codec::CodecError;
use super::types::{Capability, ClientPhase};

/// Why a transport could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectErrorKind {
    Timeout,
    Refused,
    Tls,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectErrorKind::Timeout => "timeout",
            ConnectErrorKind::Refused => "refused",
            ConnectErrorKind::Tls => "tls",
        })
    }
}

/// Failures raised by a [`Transport`](super::transport::Transport).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed ({kind}): {message}")]
    Connect {
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    pub fn connect(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self::Connect {
            kind,
            message: message.into(),
        }
    }
}

/// Every failure a caller of the MCP client or service can observe.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("connection failed ({kind}): {message}")]
    Connect {
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("handshake did not complete within {}s", .0.as_secs_f32())]
    HandshakeTimeout(Duration),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("request '{method}' timed out after {}s", .timeout.as_secs_f32())]
    RequestTimeout { method: String, timeout: Duration },

    #[error("MCP error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("server did not negotiate the '{0}' capability")]
    UnsupportedCapability(Capability),

    #[error("client is not ready (state: {0})")]
    NotReady(ClientPhase),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("reconnection gave up after {0} attempt(s)")]
    ReconnectionExhausted(u32),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("MCP server '{0}' not found")]
    ServerNotFound(String),

    #[error("MCP tool '{0}' not found")]
    ToolNotFound(String),

    #[error("MCP server '{0}' already exists")]
    DuplicateServer(String),

    /// Server ids prefix tool keys (`"{id}:{tool}"`), so they may not contain `:`.
    #[error("invalid MCP server id '{0}': must not contain ':'")]
    InvalidServerId(String),

    #[error("failed to persist server configs: {0}")]
    Persistence(String),
}

impl From<TransportError> for McpError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect { kind, message } => McpError::Connect { kind, message },
            TransportError::Send(msg) => McpError::Transport(msg),
            TransportError::Closed => McpError::ConnectionClosed,
        }
    }
}

impl McpError {
    /// Machine-readable code, used by the admin API and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            McpError::Connect { .. } => "CONNECT_ERROR",
            McpError::HandshakeTimeout(_) => "HANDSHAKE_TIMEOUT",
            McpError::ProtocolMismatch(_) => "PROTOCOL_MISMATCH",
            McpError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            McpError::Rpc { .. } => "RPC_ERROR",
            McpError::UnsupportedCapability(_) => "UNSUPPORTED_CAPABILITY",
            McpError::NotReady(_) => "NOT_READY",
            McpError::ConnectionClosed => "CONNECTION_CLOSED",
            McpError::ReconnectionExhausted(_) => "RECONNECTION_EXHAUSTED",
            McpError::Transport(_) => "TRANSPORT_ERROR",
            McpError::Codec(CodecError::Encoding(_)) => "ENCODING_ERROR",
            McpError::Codec(CodecError::Decoding(_)) => "DECODING_ERROR",
            McpError::ServerNotFound(_) => "SERVER_NOT_FOUND",
            McpError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            McpError::DuplicateServer(_) => "DUPLICATE_SERVER",
            McpError::InvalidServerId(_) => "INVALID_SERVER_ID",
            McpError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_onto_taxonomy() {
        let err: McpError = TransportError::connect(ConnectErrorKind::Tls, "bad cert").into();
        assert!(matches!(
            err,
            McpError::Connect {
                kind: ConnectErrorKind::Tls,
                ..
            }
        ));
        assert_eq!(err.code(), "CONNECT_ERROR");

        let err: McpError = TransportError::Send("HTTP 502".into()).into();
        assert_eq!(err.to_string(), "transport error: HTTP 502");

        let err: McpError = TransportError::Closed.into();
        assert!(matches!(err, McpError::ConnectionClosed));
    }

    #[test]
    fn rpc_error_display_includes_code() {
        let err = McpError::Rpc {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "MCP error -32601: Method not found");
    }
}
