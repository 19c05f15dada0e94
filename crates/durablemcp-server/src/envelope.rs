//! The versioned message envelope handed to the session servicer.
//!
//! The servicer may run in a different process than the HTTP front-end, so
//! everything a message needs, including the verified access token that
//! lives in request-local state on the HTTP side, travels inside a typed,
//! versioned JSON envelope. Decoding always applies numeric normalization
//! so a message that crossed the boundary validates identically to one
//! that never left the process.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use durablemcp_protocol::jsonrpc::JsonRpcMessage;
use durablemcp_protocol::normalize::normalize_numbers;

use crate::auth::AccessToken;
use crate::error::ServerError;

/// Current envelope encoding version.
pub const ENVELOPE_VERSION: u32 = 1;

/// One inbound message plus the cross-process state it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Encoding version.
    pub version: u32,
    /// The JSON-RPC message.
    pub message: JsonRpcMessage,
    /// Id of the request this message relates to, when not derivable from
    /// the message itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_request_id: Option<String>,
    /// The verified access token of the originating HTTP request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
}

impl MessageEnvelope {
    /// Wrap a message.
    pub fn new(message: JsonRpcMessage) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message,
            related_request_id: None,
            access_token: None,
        }
    }

    /// Attach the originating request id.
    pub fn with_related_request_id(mut self, id: impl Into<String>) -> Self {
        self.related_request_id = Some(id.into());
        self
    }

    /// Attach the verified access token.
    pub fn with_access_token(mut self, token: Option<AccessToken>) -> Self {
        self.access_token = token;
        self
    }

    /// Serialize to the persisted/cross-process form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ServerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the persisted/cross-process form, normalizing numbers
    /// before strict validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ServerError> {
        let mut value: Value = serde_json::from_slice(bytes)?;
        normalize_numbers(&mut value);
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durablemcp_protocol::jsonrpc::{JsonRpcRequest, RequestId};
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let request = JsonRpcRequest::new(
            "tools/call",
            Some(json!({"name": "add", "arguments": {"a": 5, "b": 3}})),
            RequestId::Number(1),
        );
        let envelope = MessageEnvelope::new(request.into())
            .with_related_request_id("1")
            .with_access_token(Some(AccessToken {
                token: "secret".into(),
                client_id: "client".into(),
                scopes: vec!["read".into()],
                expires_at: None,
            }));

        let bytes = envelope.to_bytes().unwrap();
        let decoded = MessageEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.version, ENVELOPE_VERSION);
        assert_eq!(decoded.related_request_id.as_deref(), Some("1"));
        assert_eq!(decoded.access_token.unwrap().client_id, "client");
    }

    #[test]
    fn decode_normalizes_integral_floats() {
        // A request whose integer arguments were widened to floats by an
        // intermediate encoding decodes back to integers.
        let bytes = br#"{
            "version": 1,
            "message": {"jsonrpc": "2.0", "method": "tools/call",
                        "params": {"arguments": {"a": 5.0}}, "id": 1.0}
        }"#;
        let decoded = MessageEnvelope::from_bytes(bytes).unwrap();
        match decoded.message {
            JsonRpcMessage::Request(request) => {
                assert_eq!(request.id, RequestId::Number(1));
                assert_eq!(request.params.unwrap()["arguments"]["a"], json!(5));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }
}
