// Jaskier Shared Pattern -- mcp/codec
//! JSON-RPC 2.0 envelope codec. Pure: no I/O, no state.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode JSON-RPC message: {0}")]
    Encoding(String),

    #[error("failed to decode JSON-RPC message: {0}")]
    Decoding(String),
}

/// Request id: JSON-RPC allows numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// The `error` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self::new(error_codes::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }
}

/// What an envelope represents, decided by which members are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Invalid,
}

/// A JSON-RPC 2.0 message of any shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// Keeps an explicit `null` as `Some(Value::Null)` so it survives a round trip.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    fn blank() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: impl Serialize) -> Result<Self, CodecError> {
        Ok(Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(to_value(params)?),
            ..Self::blank()
        })
    }

    pub fn notification(method: impl Into<String>, params: impl Serialize) -> Result<Self, CodecError> {
        Ok(Self {
            method: Some(method.into()),
            params: Some(to_value(params)?),
            ..Self::blank()
        })
    }

    pub fn success(id: RequestId, result: impl Serialize) -> Result<Self, CodecError> {
        Ok(Self {
            id: Some(id),
            result: Some(to_value(result)?),
            ..Self::blank()
        })
    }

    pub fn failure(id: RequestId, error: RpcErrorObject) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::blank()
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Response,
            (None, Some(_)) => MessageKind::Notification,
            (None, None) => MessageKind::Invalid,
        }
    }
}

fn to_value(value: impl Serialize) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Encoding(e.to_string()))
}

/// Serialize an envelope into one text frame.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    if envelope.jsonrpc != JSONRPC_VERSION {
        return Err(CodecError::Encoding(format!(
            "unsupported jsonrpc version '{}'",
            envelope.jsonrpc
        )));
    }
    serde_json::to_string(envelope).map_err(|e| CodecError::Encoding(e.to_string()))
}

/// Parse one inbound frame.
pub fn decode(frame: &str) -> Result<Envelope, CodecError> {
    let envelope: Envelope =
        serde_json::from_str(frame).map_err(|e| CodecError::Decoding(e.to_string()))?;
    if envelope.jsonrpc != JSONRPC_VERSION {
        return Err(CodecError::Decoding(format!(
            "expected jsonrpc \"2.0\", got \"{}\"",
            envelope.jsonrpc
        )));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_every_shape() {
        let samples = vec![
            Envelope::request(7i64, "tools/call", json!({"name": "echo", "arguments": {"text": "hi"}})).unwrap(),
            Envelope::request(RequestId::String("abc".into()), "ping", json!({})).unwrap(),
            Envelope::notification("notifications/initialized", json!({})).unwrap(),
            Envelope::success(RequestId::Number(7), json!({"content": "hi"})).unwrap(),
            Envelope::success(RequestId::Number(8), Value::Null).unwrap(),
            Envelope::failure(
                RequestId::Number(9),
                RpcErrorObject {
                    code: -32000,
                    message: "boom".into(),
                    data: Some(json!({"detail": [1, 2]})),
                },
            ),
        ];
        for envelope in samples {
            let frame = encode(&envelope).unwrap();
            assert_eq!(decode(&frame).unwrap(), envelope, "frame: {frame}");
        }
    }

    #[test]
    fn classifies_messages() {
        let req = decode(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req.kind(), MessageKind::Request);
        let resp = decode(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert_eq!(resp.kind(), MessageKind::Response);
        let note = decode(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#).unwrap();
        assert_eq!(note.kind(), MessageKind::Notification);
        let empty = decode(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert_eq!(empty.kind(), MessageKind::Invalid);
    }

    #[test]
    fn rejects_wrong_version_and_garbage() {
        assert!(matches!(
            decode(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#),
            Err(CodecError::Decoding(_))
        ));
        assert!(matches!(decode(r#"{"id":1,"result":{}}"#), Err(CodecError::Decoding(_))));
        assert!(matches!(decode("not json"), Err(CodecError::Decoding(_))));
    }

    #[test]
    fn encode_rejects_foreign_version() {
        let mut envelope = Envelope::notification("x", json!({})).unwrap();
        envelope.jsonrpc = "1.0".into();
        assert!(matches!(encode(&envelope), Err(CodecError::Encoding(_))));
    }

    #[test]
    fn string_ids_stay_strings() {
        let envelope = decode(r#"{"jsonrpc":"2.0","id":"42","result":1}"#).unwrap();
        assert_eq!(envelope.id, Some(RequestId::String("42".into())));
    }
}
