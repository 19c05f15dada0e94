//! JSON-RPC 2.0 framing.
//!
//! MCP is a JSON-RPC 2.0 dialect; this module provides the message types
//! with version-checked (de)serialization. Batching is deliberately absent:
//! the streamable-HTTP transport revision this runtime targets removed it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker that serializes as the literal `"2.0"` and refuses
/// anything else on the way in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// A JSON-RPC request id.
///
/// The wire allows string or integer ids for the same logical request, so
/// anything keying internal maps by request id must go through
/// [`RequestId::canonical`] rather than the raw value: `1` and `"1"` name
/// the same request and must not demultiplex into separate entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id
    Number(i64),
    /// String id
    String(String),
}

impl RequestId {
    /// The canonical string form used for stream ids, map keys, and
    /// qualified event ids.
    pub fn canonical(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// JSON-RPC request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Version marker, always `"2.0"`.
    pub jsonrpc: JsonRpcVersion,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Request parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request id.
    pub id: RequestId,
}

impl JsonRpcRequest {
    /// Create a new request.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC notification message (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Version marker, always `"2.0"`.
    pub jsonrpc: JsonRpcVersion,
    /// Method name, e.g. `notifications/progress`.
    pub method: String,
    /// Notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// Response id. Parse errors carry `null` instead of the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub Option<RequestId>);

impl ResponseId {
    /// Response id echoing a request.
    pub fn from_request(id: RequestId) -> Self {
        Self(Some(id))
    }

    /// Null response id (parse error).
    pub fn null() -> Self {
        Self(None)
    }

    /// The request id, if this is not a parse-error response.
    pub fn as_request_id(&self) -> Option<&RequestId> {
        self.0.as_ref()
    }
}

/// JSON-RPC success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Version marker, always `"2.0"`.
    pub jsonrpc: JsonRpcVersion,
    /// Result payload.
    pub result: Value,
    /// Id of the request being answered.
    pub id: ResponseId,
}

impl JsonRpcResponse {
    /// Create a success response for a request.
    pub fn new(result: Value, id: RequestId) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            result,
            id: ResponseId::from_request(id),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Version marker, always `"2.0"`.
    pub jsonrpc: JsonRpcVersion,
    /// Error payload.
    pub error: ErrorObject,
    /// Id of the request being answered (`null` for parse errors).
    pub id: ResponseId,
}

impl JsonRpcError {
    /// Create an error response for a request.
    pub fn new(code: JsonRpcErrorCode, message: impl Into<String>, id: RequestId) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            error: ErrorObject {
                code: code.code(),
                message: message.into(),
                data: None,
            },
            id: ResponseId::from_request(id),
        }
    }

    /// Create a parse-error response (id is `null`).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            error: ErrorObject {
                code: JsonRpcErrorCode::ParseError.code(),
                message: message.into(),
                data: None,
            },
            id: ResponseId::null(),
        }
    }
}

/// Standard JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    /// Parse error (-32700)
    ParseError,
    /// Invalid request (-32600)
    InvalidRequest,
    /// Method not found (-32601)
    MethodNotFound,
    /// Invalid params (-32602)
    InvalidParams,
    /// Internal error (-32603)
    InternalError,
    /// Application-defined error
    Application(i32),
}

impl JsonRpcErrorCode {
    /// The numeric error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::Application(code) => *code,
        }
    }
}

/// Union of the JSON-RPC message kinds.
///
/// Deserialization order matters: a request has both `method` and `id`, a
/// notification only `method`, responses only `id`: untagged matching
/// tries variants in declaration order, so requests come first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request message
    Request(JsonRpcRequest),
    /// Notification message
    Notification(JsonRpcNotification),
    /// Success response
    Response(JsonRpcResponse),
    /// Error response
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Whether this message terminates a request stream (final response or
    /// error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }

    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// The params, for requests and notifications.
    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request(r) => r.params.as_ref(),
            Self::Notification(n) => n.params.as_ref(),
            _ => None,
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(r: JsonRpcRequest) -> Self {
        Self::Request(r)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(n: JsonRpcNotification) -> Self {
        Self::Notification(n)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(r: JsonRpcResponse) -> Self {
        Self::Response(r)
    }
}

impl From<JsonRpcError> for JsonRpcMessage {
    fn from(e: JsonRpcError) -> Self {
        Self::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn version_round_trip() {
        let json = serde_json::to_string(&JsonRpcVersion).unwrap();
        assert_eq!(json, "\"2.0\"");
        assert!(serde_json::from_str::<JsonRpcVersion>("\"1.0\"").is_err());
    }

    #[test]
    fn request_id_canonicalization() {
        assert_eq!(RequestId::Number(1).canonical(), "1");
        assert_eq!(RequestId::String("1".into()).canonical(), "1");
        // The two wire forms of the same logical id canonicalize together.
        assert_eq!(
            RequestId::Number(42).canonical(),
            RequestId::String("42".into()).canonical()
        );
    }

    #[test]
    fn message_discrimination() {
        let request: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "tools/call", "id": 1}))
                .unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(_)));

        let notification: JsonRpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        let response: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "result": {"ok": true}, "id": "1"}))
                .unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(_)));
        assert!(response.is_terminal());

        let error: JsonRpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "error": {"code": -32601, "message": "nope"}, "id": 1}),
        )
        .unwrap();
        assert!(matches!(error, JsonRpcMessage::Error(_)));
        assert!(error.is_terminal());
    }

    #[test]
    fn parse_error_has_null_id() {
        let error = JsonRpcError::parse_error("bad json");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], json!(-32700));
    }

    #[test]
    fn request_serialization_round_trip() {
        let request = JsonRpcRequest::new(
            "tools/call",
            Some(json!({"name": "add", "arguments": {"a": 5, "b": 3}})),
            RequestId::Number(7),
        );
        let json = serde_json::to_string(&request).unwrap();
        let parsed: JsonRpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.method, request.method);
        assert_eq!(parsed.params, request.params);
        assert_eq!(parsed.id, request.id);
    }
}
