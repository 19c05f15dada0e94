//! # DurableMCP Protocol
//!
//! Wire types for the durable MCP runtime: JSON-RPC 2.0 framing, the MCP
//! message subset the runtime speaks, and the event-id scheme that makes
//! outbound messages replayable.
//!
//! The crates above this one never touch raw JSON for protocol concerns;
//! everything round-trips through the types here so that a message decoded
//! from the durable log is indistinguishable from one freshly parsed off
//! the wire (see [`normalize`] for the numeric-coercion step that makes
//! that true).

pub mod error;
pub mod event_id;
pub mod jsonrpc;
pub mod normalize;
pub mod types;

pub use error::ProtocolError;
pub use event_id::{
    EventId, StreamKey, VSCODE_GET_STREAM, derive_event_id, qualified_event_id,
    request_id_from_qualified,
};
pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ResponseId,
};
pub use types::ClientInfo;

/// The MCP protocol revision this runtime implements.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// HTTP header carrying the MCP session id.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// HTTP header carrying the negotiated MCP protocol version.
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// HTTP header carrying the SSE resumption token.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
