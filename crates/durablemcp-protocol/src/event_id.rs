//! Event-id derivation and qualification.
//!
//! Every outbound message stored for replay carries an event id. The inner
//! id is deterministic for replayable server-initiated side effects (UUIDv5
//! over the workflow id and an alias string describing the call site) and
//! derived from the request id for terminal responses. Externally, ids are
//! qualified as `"<request_id>/<inner_event_id>"` so a resumption token
//! alone identifies the stream it belongs to.

use uuid::Uuid;

use crate::error::ProtocolError;
use crate::jsonrpc::JsonRpcMessage;
use crate::types::reboot_event_id;

/// Inner or qualified event id.
pub type EventId = String;

/// Stream key within a session: the canonical request id, or the aggregate
/// GET stream sentinel.
pub type StreamKey = String;

/// Request-id sentinel for the aggregate stream consumed by clients that
/// require a single GET stream.
pub const VSCODE_GET_STREAM: &str = "VSCODE_GET";

/// Sentinel `Last-Event-ID` injected on a VSCode GET without one, forcing a
/// replay of the aggregate stream from the beginning.
pub const VSCODE_INITIAL_GET_LAST_EVENT_ID: &str = "VSCODE_INITIAL_GET_LAST_EVENT_ID";

/// Derive the inner event id for an outbound message.
///
/// Requests and notifications must carry `params._meta.rebootEventId`;
/// terminal responses and errors use the stringified request id, which is
/// sufficient since a stream holds exactly one terminal.
pub fn derive_event_id(message: &JsonRpcMessage) -> Result<EventId, ProtocolError> {
    match message {
        JsonRpcMessage::Request(request) => reboot_event_id(request.params.as_ref())
            .ok_or_else(|| ProtocolError::MissingEventId {
                method: request.method.clone(),
            }),
        JsonRpcMessage::Notification(notification) => {
            reboot_event_id(notification.params.as_ref()).ok_or_else(|| {
                ProtocolError::MissingEventId {
                    method: notification.method.clone(),
                }
            })
        }
        JsonRpcMessage::Response(response) => Ok(response
            .id
            .as_request_id()
            .map(|id| id.canonical())
            .unwrap_or_default()),
        JsonRpcMessage::Error(error) => Ok(error
            .id
            .as_request_id()
            .map(|id| id.canonical())
            .unwrap_or_default()),
    }
}

/// Deterministic event id for a replayable server-initiated side effect:
/// UUIDv5 of the event alias in the workflow-id namespace, hex-encoded.
///
/// Two executions of the same handler with the same workflow id produce the
/// same id for the same alias, which is what makes replay dedupe work.
pub fn deterministic_event_id(workflow_id: &Uuid, event_alias: &str) -> EventId {
    Uuid::new_v5(workflow_id, event_alias.as_bytes()).simple().to_string()
}

/// Qualify an inner event id with the stream's request id.
pub fn qualified_event_id(request_id: &str, event_id: &str) -> EventId {
    format!("{request_id}/{event_id}")
}

/// Split a qualified event id back into its request-id prefix.
///
/// Splits on the last `/` so request ids containing slashes stay intact.
pub fn request_id_from_qualified(event_id: &str) -> Result<&str, ProtocolError> {
    event_id
        .rfind('/')
        .map(|index| &event_id[..index])
        .ok_or_else(|| ProtocolError::MalformedEventId {
            event_id: event_id.to_string(),
        })
}
