// Jaskier Shared Pattern -- mcp/transport/websocket
//! Full-duplex transport over a single WebSocket.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::{InboundFrames, Transport, classify_connect_failure};
use crate::mcp::error::{ConnectErrorKind, TransportError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketTransport {
    sink: Mutex<Option<WsSink>>,
    cancel: CancellationToken,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<InboundFrames, TransportError> {
        let mut request = url.into_client_request().map_err(|e| {
            TransportError::connect(ConnectErrorKind::Refused, format!("invalid WebSocket URL '{url}': {e}"))
        })?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                TransportError::connect(ConnectErrorKind::Refused, format!("invalid header name '{key}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::connect(ConnectErrorKind::Refused, format!("invalid value for header '{key}': {e}"))
            })?;
            request.headers_mut().insert(name, value);
        }

        tracing::debug!(url = %url, "MCP: opening WebSocket");
        let (stream, _) = connect_async(request).await.map_err(|e| {
            let message = format!("WebSocket connect to '{url}' failed: {e}");
            TransportError::connect(classify_connect_failure(&message, false), message)
        })?;
        let (write, mut read) = stream.split();
        *self.sink.lock().await = Some(write);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let endpoint = url.to_string();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = read.next() => next,
                };
                let text = match next {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(url = %endpoint, "MCP: dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(url = %endpoint, error = %e, "MCP: WebSocket read error");
                        break;
                    }
                };
                if tx.send(text).is_err() {
                    break;
                }
            }
            tracing::debug!(url = %endpoint, "MCP: WebSocket stream ended");
        });

        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Send(format!("WebSocket send failed: {e}")))
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_socket_is_closed() {
        let transport = WebSocketTransport::new();
        assert!(matches!(transport.send("{}".into()).await, Err(TransportError::Closed)));
        transport.close().await;
    }

    #[tokio::test]
    async fn rejects_invalid_header_names() {
        let transport = WebSocketTransport::new();
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let err = transport.connect("ws://127.0.0.1:9/mcp", &headers).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect {
                kind: ConnectErrorKind::Refused,
                ..
            }
        ));
    }
}
