// Jaskier Shared Pattern -- mcp/transport/sse
//! SSE read leg + HTTP POST write leg.
//!
//! The stream is opened with a GET on the configured URL. Writes go to the
//! URL announced by the server's `endpoint` event; until one arrives (or if
//! the server never sends one) a URL derived from the stream URL is used:
//! a trailing `/sse` becomes `/messages`, anything else is POSTed to as-is.
//!
//! Servers that answer a POST inline (JSON or an SSE body) are supported too:
//! those replies are forwarded to the inbound stream like pushed frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{InboundFrames, Transport, classify_connect_failure, truncate_str};
use crate::mcp::error::{ConnectErrorKind, TransportError};

/// How long `connect` waits for the server's `endpoint` event before falling
/// back to the derived POST URL.
const ENDPOINT_WAIT: Duration = Duration::from_secs(2);

// ── SSE event parser ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental parser: feed raw chunks, get back complete events.
///
/// Chunk boundaries may fall anywhere: inside a UTF-8 sequence (use
/// [`feed_bytes`](Self::feed_bytes)) or between the `\r` and `\n` of a CRLF.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    /// Leading bytes of a UTF-8 sequence the next chunk completes.
    partial: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw network bytes. Only complete UTF-8 sequences are decoded;
    /// a truncated trailing sequence waits for the next chunk.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(chunk);
        let complete = match std::str::from_utf8(&self.partial) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.partial.len(),
        };
        let tail = self.partial.split_off(complete);
        let head = std::mem::replace(&mut self.partial, tail);
        self.feed(&String::from_utf8_lossy(&head))
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        // A trailing '\r' may be the first half of a CRLF split across chunks.
        let held_cr = self.buffer.ends_with('\r');
        if held_cr {
            self.buffer.pop();
        }
        self.normalise();

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }
        if held_cr {
            self.buffer.push('\r');
        }
        events
    }

    pub fn flush(&mut self) -> Vec<SseEvent> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
        }
        self.normalise();
        let block = std::mem::take(&mut self.buffer);
        Self::parse_block(&block).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.partial.is_empty()
    }

    fn normalise(&mut self) {
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
    }

    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event = None;
        let mut data: Option<String> = None;
        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => match &mut data {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                _ => {}
            }
        }
        data.map(|data| SseEvent { event, data })
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

pub struct SseTransport {
    http: reqwest::Client,
    headers: RwLock<HeaderMap>,
    post_url: Arc<RwLock<Option<String>>>,
    /// `Mcp-Session-Id` handed out by the server, echoed on every POST.
    session_id: RwLock<Option<String>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    cancel: CancellationToken,
}

impl SseTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            headers: RwLock::new(HeaderMap::new()),
            post_url: Arc::new(RwLock::new(None)),
            session_id: RwLock::new(None),
            inbound: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Current write endpoint, if the stream is open.
    pub fn post_url(&self) -> Option<String> {
        self.post_url.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn inbound_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.inbound.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn reader_loop(
        mut stream: futures_util::stream::BoxStream<'static, Result<Vec<u8>, String>>,
        tx: mpsc::UnboundedSender<String>,
        stream_url: String,
        post_url: Arc<RwLock<Option<String>>>,
        mut endpoint_tx: Option<oneshot::Sender<()>>,
        inbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
        cancel: CancellationToken,
    ) {
        let mut parser = SseParser::new();
        'read: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(b)) => b,
                Some(Err(e)) => {
                    tracing::warn!(url = %stream_url, error = %e, "MCP: SSE stream read error");
                    break;
                }
                None => break,
            };
            for event in parser.feed_bytes(&bytes) {
                if event.event.as_deref() == Some("endpoint") {
                    match resolve_endpoint(&stream_url, &event.data) {
                        Ok(resolved) => {
                            tracing::debug!(post_url = %resolved, "MCP: received SSE endpoint");
                            *post_url.write().unwrap_or_else(|p| p.into_inner()) = Some(resolved);
                            if let Some(done) = endpoint_tx.take() {
                                let _ = done.send(());
                            }
                        }
                        Err(e) => tracing::warn!("MCP: ignoring endpoint event: {}", e),
                    }
                } else if event.is_message() && !event.data.is_empty() && tx.send(event.data).is_err() {
                    break 'read;
                }
            }
        }
        // Dropping the last sender ends the inbound stream for the client.
        inbound.lock().unwrap_or_else(|p| p.into_inner()).take();
        tracing::debug!(url = %stream_url, "MCP: SSE stream ended");
    }

    async fn forward_inline_reply(&self, response: reqwest::Response) {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = match response.text().await {
            Ok(body) if !body.trim().is_empty() => body,
            _ => return,
        };
        let Some(tx) = self.inbound_sender() else {
            return;
        };
        if content_type.contains("text/event-stream") {
            let mut parser = SseParser::new();
            let mut events = parser.feed(&body);
            events.extend(parser.flush());
            for event in events.into_iter().filter(SseEvent::is_message) {
                let _ = tx.send(event.data);
            }
        } else if content_type.contains("application/json") {
            let _ = tx.send(body);
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<InboundFrames, TransportError> {
        let header_map = build_header_map(headers)?;
        *self.headers.write().unwrap_or_else(|p| p.into_inner()) = header_map.clone();

        tracing::debug!(url = %url, "MCP: opening SSE stream");
        let response = self
            .http
            .get(url)
            .headers(header_map)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| {
                let message = format!("SSE request to '{url}' failed: {e:?}");
                TransportError::connect(classify_connect_failure(&message, e.is_timeout()), message)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::connect(
                ConnectErrorKind::Refused,
                format!("SSE endpoint returned HTTP {}: {}", status, truncate_str(&body, 300)),
            ));
        }

        *self.post_url.write().unwrap_or_else(|p| p.into_inner()) = Some(derive_post_url(url));

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx.clone());

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        tokio::spawn(Self::reader_loop(
            stream,
            tx,
            url.to_string(),
            self.post_url.clone(),
            Some(endpoint_tx),
            self.inbound.clone(),
            self.cancel.child_token(),
        ));

        if tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx).await.is_err() {
            tracing::debug!(
                post_url = ?self.post_url(),
                "MCP: no endpoint event, using derived POST URL"
            );
        }
        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let post_url = self.post_url().ok_or(TransportError::Closed)?;
        let headers = self.headers.read().unwrap_or_else(|p| p.into_inner()).clone();
        let session_id = self.session_id.read().unwrap_or_else(|p| p.into_inner()).clone();

        let mut req = self
            .http
            .post(&post_url)
            .headers(headers)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .body(frame);
        if let Some(sid) = session_id {
            req = req.header("Mcp-Session-Id", sid);
        }

        let response = req
            .send()
            .await
            .map_err(|e| TransportError::Send(format!("POST to '{post_url}' failed: {e}")))?;

        if let Some(sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().unwrap_or_else(|p| p.into_inner()) = Some(sid.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Send(format!(
                "MCP server returned HTTP {}: {}",
                status,
                truncate_str(&body, 500)
            )));
        }

        self.forward_inline_reply(response).await;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.inbound.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.post_url.write().unwrap_or_else(|p| p.into_inner()).take();
    }
}

fn build_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            TransportError::connect(ConnectErrorKind::Refused, format!("invalid header name '{key}': {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            TransportError::connect(ConnectErrorKind::Refused, format!("invalid value for header '{key}': {e}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Write endpoint used until the server announces one.
pub fn derive_post_url(stream_url: &str) -> String {
    let (base, query) = match stream_url.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (stream_url, None),
    };
    let trimmed = base.trim_end_matches('/');
    let derived = match trimmed.strip_suffix("/sse") {
        Some(prefix) => format!("{prefix}/messages"),
        None => base.to_string(),
    };
    match query {
        Some(q) => format!("{derived}?{q}"),
        None => derived,
    }
}

fn resolve_endpoint(stream_url: &str, data: &str) -> Result<String, String> {
    let data = data.trim();
    if data.starts_with("http://") || data.starts_with("https://") {
        return Ok(data.to_string());
    }
    let base = url::Url::parse(stream_url).map_err(|e| format!("bad stream URL '{stream_url}': {e}"))?;
    base.join(data)
        .map(|u| u.to_string())
        .map_err(|e| format!("cannot resolve '{data}' against '{stream_url}': {e}"))
}
