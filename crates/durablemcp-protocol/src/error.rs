//! Protocol error types.

/// Errors produced while framing or deriving identity for MCP messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A server-initiated request or notification was emitted without a
    /// `params._meta.rebootEventId`, so it cannot be stored for replay.
    #[error("missing event id for outbound '{method}'")]
    MissingEventId {
        /// Method of the offending message.
        method: String,
    },

    /// A qualified event id did not contain a `/` separator.
    #[error("malformed qualified event id: '{event_id}'")]
    MalformedEventId {
        /// The offending id.
        event_id: String,
    },

    /// Message (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
