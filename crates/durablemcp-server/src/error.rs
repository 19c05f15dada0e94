//! Server error types.

use durablemcp_protocol::ProtocolError;
use durablemcp_protocol::jsonrpc::JsonRpcErrorCode;
use durablemcp_runtime::RuntimeError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors produced across the durable MCP server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Wire-level protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// State-runtime or workflow-executor error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Message (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler failed.
    #[error("{message}")]
    Handler {
        /// Error message.
        message: String,
    },

    /// A tool refused the caller (scope or client-id check).
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// What was missing.
        message: String,
    },

    /// Request parameters did not validate.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// What was wrong.
        message: String,
    },

    /// Unknown JSON-RPC method.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// The unknown method.
        method: String,
    },

    /// `tools/call` named an unregistered tool.
    #[error("unknown tool: {name}")]
    UnknownTool {
        /// The unknown tool name.
        name: String,
    },

    /// `resources/read` named an unregistered resource.
    #[error("unknown resource: {uri}")]
    UnknownResource {
        /// The unknown URI.
        uri: String,
    },

    /// `prompts/get` named an unregistered prompt.
    #[error("unknown prompt: {name}")]
    UnknownPrompt {
        /// The unknown prompt name.
        name: String,
    },

    /// An elicitation schema used non-primitive types.
    #[error("elicitation schema must only use primitive types: {message}")]
    InvalidElicitationSchema {
        /// What was non-primitive.
        message: String,
    },

    /// A server-initiated request was cancelled before the client answered.
    #[error("server-initiated request cancelled")]
    RequestCancelled,

    /// An in-memory channel closed while a message was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// Transport-level failure.
    #[error("transport error: {message}")]
    Transport {
        /// What failed.
        message: String,
    },

    /// The internal re-routing proxy failed.
    #[error("proxy request failed: {message}")]
    Proxy {
        /// What failed.
        message: String,
    },
}

impl ServerError {
    /// Handler-level error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Permission denied inside a tool body.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Invalid request parameters.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// The JSON-RPC error code this error maps to on the wire.
    pub fn jsonrpc_code(&self) -> JsonRpcErrorCode {
        match self {
            Self::MethodNotFound { .. } => JsonRpcErrorCode::MethodNotFound,
            Self::InvalidParams { .. }
            | Self::UnknownTool { .. }
            | Self::UnknownResource { .. }
            | Self::UnknownPrompt { .. } => JsonRpcErrorCode::InvalidParams,
            _ => JsonRpcErrorCode::InternalError,
        }
    }

    /// Convert to the runtime's error type for use inside workflow steps.
    pub fn into_runtime(self) -> RuntimeError {
        match self {
            Self::Runtime(error) => error,
            other => RuntimeError::app(other.to_string()),
        }
    }
}
