// Jaskier Shared Pattern -- mcp/transport
//! Transport abstraction: an inbound frame stream plus an outbound send
//! channel. The two legs are independent; nothing here assumes a response
//! travels on the connection its request was sent on.

pub mod loopback;
pub mod sse;
pub mod websocket;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{ConnectErrorKind, TransportError};
use super::types::ServerConfig;

pub use loopback::{LoopbackFactory, LoopbackServer};
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

/// Inbound frames in arrival order. The stream ends when the server side
/// goes away or the transport is closed.
pub type InboundFrames = mpsc::UnboundedReceiver<String>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the inbound leg. Frames are delivered FIFO on the returned receiver.
    async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<InboundFrames, TransportError>;

    /// Deliver one outbound frame.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Tear down both legs. Safe to call more than once.
    async fn close(&self);
}

/// Builds a fresh transport for each connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, TransportError>;
}

/// Transport selected from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// `http(s)://`: SSE stream in, HTTP POST out.
    Sse,
    /// `ws(s)://`: one full-duplex socket.
    WebSocket,
    /// `loopback://`: in-process server.
    Loopback,
}

impl TransportKind {
    pub fn from_url(raw: &str) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(raw).map_err(|e| {
            TransportError::connect(ConnectErrorKind::Refused, format!("invalid URL '{raw}': {e}"))
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(TransportKind::Sse),
            "ws" | "wss" => Ok(TransportKind::WebSocket),
            "loopback" => Ok(TransportKind::Loopback),
            other => Err(TransportError::connect(
                ConnectErrorKind::Refused,
                format!("unsupported URL scheme '{other}'"),
            )),
        }
    }
}

/// Production factory: dispatches on [`TransportKind`].
#[derive(Clone)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
    loopback: Option<LoopbackFactory>,
}

impl DefaultTransportFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            loopback: None,
        }
    }

    /// Route `loopback://` URLs to in-process servers.
    pub fn with_loopback(mut self, loopback: LoopbackFactory) -> Self {
        self.loopback = Some(loopback);
        self
    }

    /// HTTP client tuned for long-lived event streams: no total timeout, a
    /// bounded connect phase.
    pub fn default_http_client() -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(5))
            .build()
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, TransportError> {
        match TransportKind::from_url(&config.url)? {
            TransportKind::Sse => Ok(Box::new(SseTransport::new(self.http.clone()))),
            TransportKind::WebSocket => Ok(Box::new(WebSocketTransport::new())),
            TransportKind::Loopback => match &self.loopback {
                Some(loopback) => loopback.create(config),
                None => Err(TransportError::connect(
                    ConnectErrorKind::Refused,
                    "no in-process servers are registered",
                )),
            },
        }
    }
}

/// Shorten a body for log lines and error messages, on a char boundary.
pub(crate) fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_len);
        format!("{}...", &s[..boundary])
    }
}

/// Best-effort split of an opaque connect failure into timeout / refused / tls.
pub(crate) fn classify_connect_failure(message: &str, timed_out: bool) -> ConnectErrorKind {
    let lower = message.to_ascii_lowercase();
    if timed_out || lower.contains("timed out") {
        ConnectErrorKind::Timeout
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        ConnectErrorKind::Tls
    } else {
        ConnectErrorKind::Refused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_transport_from_scheme() {
        assert_eq!(TransportKind::from_url("https://example.com/sse").unwrap(), TransportKind::Sse);
        assert_eq!(TransportKind::from_url("wss://example/mcp").unwrap(), TransportKind::WebSocket);
        assert_eq!(TransportKind::from_url("loopback://alpha").unwrap(), TransportKind::Loopback);
        assert!(matches!(
            TransportKind::from_url("ftp://example.com"),
            Err(TransportError::Connect {
                kind: ConnectErrorKind::Refused,
                ..
            })
        ));
        assert!(TransportKind::from_url("not a url").is_err());
    }

    #[test]
    fn loopback_without_registry_is_refused() {
        let factory = DefaultTransportFactory::new(reqwest::Client::new());
        let cfg = ServerConfig::new("x", "X", "loopback://nowhere");
        assert!(factory.create(&cfg).is_err());
    }

    #[tokio::test]
    async fn embedded_servers_are_reached_through_the_default_factory() {
        let server = LoopbackServer::new().with_name("embedded");
        let loopback = LoopbackFactory::new();
        loopback.register("embedded", server.clone());
        let factory = DefaultTransportFactory::new(reqwest::Client::new()).with_loopback(loopback);

        let transport = factory
            .create(&ServerConfig::new("e", "Embedded", "loopback://embedded"))
            .unwrap();
        let mut frames = transport.connect("loopback://embedded", &HashMap::new()).await.unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .unwrap();
        let reply = frames.recv().await.unwrap();
        assert!(reply.contains(r#""id":1"#), "{reply}");
        assert_eq!(server.connect_count(), 1);

        assert!(factory
            .create(&ServerConfig::new("o", "Other", "loopback://other"))
            .is_err());
        transport.close().await;
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn classifies_connect_failures() {
        assert_eq!(classify_connect_failure("operation timed out", false), ConnectErrorKind::Timeout);
        assert_eq!(classify_connect_failure("invalid peer certificate", false), ConnectErrorKind::Tls);
        assert_eq!(classify_connect_failure("connection refused", false), ConnectErrorKind::Refused);
        assert_eq!(classify_connect_failure("whatever", true), ConnectErrorKind::Timeout);
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
    }
}
