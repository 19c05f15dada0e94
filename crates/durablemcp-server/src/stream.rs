//! The per-request event log.
//!
//! A *stream* is the ordered message sequence of one JSON-RPC request
//! within a session, identified by `"<session_id>/<request_id>"` (or the
//! `VSCODE_GET` sentinel for the aggregate stream). The log is a typed
//! list plus an index on `event_id`: it never parses message semantics.
//!
//! `put` is not idempotent on its own; callers layer a once-per-workflow
//! commit key so a retried pump appends each event exactly once.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use durablemcp_protocol::jsonrpc::JsonRpcMessage;
use durablemcp_protocol::normalize::normalize_numbers;
use durablemcp_protocol::{VSCODE_GET_STREAM, qualified_event_id};
use durablemcp_runtime::{RecordRef, StateRuntime};

use crate::error::ServerError;

/// Record type holding one stream.
pub const STREAM_RECORD_KIND: &str = "durablemcp.v1.Stream";

/// Retention bound on the aggregate stream: it accumulates every event of
/// a session, so it is capped, dropping oldest. Per-request streams are
/// never trimmed.
pub const MAX_AGGREGATE_EVENTS: usize = 4096;

/// One stored message. Messages with an `event_id` are *events* and
/// participate in replay; the rest (captured inbound requests, client
/// responses to server-initiated requests) exist for audit and
/// cancellation recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The JSON-RPC message, in wire form.
    pub message: Value,
    /// Qualified event id, when this message is an event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Id of the request this message relates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_request_id: Option<String>,
}

impl StoredMessage {
    /// Decode the stored message, normalizing numbers first.
    pub fn decode(&self) -> Result<JsonRpcMessage, ServerError> {
        let mut value = self.message.clone();
        normalize_numbers(&mut value);
        Ok(serde_json::from_value(value)?)
    }
}

/// A replayable event: a stored message with its qualified id.
#[derive(Debug, Clone)]
pub struct Event {
    /// Qualified event id (`"<request_id>/<inner_event_id>"`).
    pub id: String,
    /// The decoded message.
    pub message: JsonRpcMessage,
}

/// Handle to one stream record.
#[derive(Clone)]
pub struct StreamHandle {
    runtime: Arc<dyn StateRuntime>,
    record: RecordRef,
    request_key: String,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("record", &self.record)
            .field("request_key", &self.request_key)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    /// Reference the stream of `request_key` within `session_id`.
    pub fn new(
        runtime: Arc<dyn StateRuntime>,
        session_id: &str,
        request_key: &str,
    ) -> Self {
        Self {
            runtime,
            record: RecordRef::new(STREAM_RECORD_KIND, format!("{session_id}/{request_key}")),
            request_key: request_key.to_string(),
        }
    }

    /// The stream id (`"<session_id>/<request_id>"`).
    pub fn stream_id(&self) -> &str {
        &self.record.id
    }

    /// The request-id component events are qualified with.
    pub fn request_key(&self) -> &str {
        &self.request_key
    }

    /// Create the stream, idempotently, optionally capturing the
    /// originating inbound request for audit.
    pub async fn create(&self, request: Option<&JsonRpcMessage>) -> Result<(), ServerError> {
        let request = request.map(serde_json::to_value).transpose()?;
        self.runtime
            .commit(
                &self.record,
                Some(format!("create:{}", self.record.id)),
                Box::new(move |value| {
                    if value.is_null() {
                        *value = json!({"messages": [], "request": request});
                    }
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }

    /// Append a message. `event_id` is the *inner* id; it is qualified
    /// with this stream's request key on storage.
    pub async fn put(
        &self,
        message: &JsonRpcMessage,
        event_id: Option<&str>,
        related_request_id: Option<&str>,
        idempotency_key: Option<String>,
    ) -> Result<(), ServerError> {
        let stored = StoredMessage {
            message: serde_json::to_value(message)?,
            event_id: event_id.map(|id| qualified_event_id(&self.request_key, id)),
            related_request_id: related_request_id.map(String::from),
        };
        let stored = serde_json::to_value(&stored)?;
        let bounded = self.request_key == VSCODE_GET_STREAM;
        let stream_id = self.record.id.clone();
        self.runtime
            .commit(
                &self.record,
                idempotency_key,
                Box::new(move |value| {
                    if value.is_null() {
                        *value = json!({"messages": [], "request": Value::Null});
                    }
                    let messages = value
                        .get_mut("messages")
                        .and_then(Value::as_array_mut)
                        .ok_or_else(|| {
                            durablemcp_runtime::RuntimeError::Storage(
                                "stream record has no message list".into(),
                            )
                        })?;
                    messages.push(stored);
                    if bounded && messages.len() > MAX_AGGREGATE_EVENTS {
                        let excess = messages.len() - MAX_AGGREGATE_EVENTS;
                        messages.drain(..excess);
                        tracing::warn!(
                            stream = %stream_id,
                            dropped = excess,
                            "aggregate stream exceeded retention bound"
                        );
                    }
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }

    /// All stored messages, including non-event records.
    pub async fn messages(&self) -> Result<Vec<StoredMessage>, ServerError> {
        let Some(record) = self.runtime.read(&self.record).await? else {
            return Ok(Vec::new());
        };
        let Some(messages) = record.get("messages").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        messages
            .iter()
            .map(|message| Ok(serde_json::from_value(message.clone())?))
            .collect()
    }

    /// Replay events strictly after `last_event_id` (all events when
    /// omitted), then keep yielding as new events are appended. The
    /// stream ends after yielding a terminal response/error event.
    pub fn replay(
        &self,
        last_event_id: Option<String>,
    ) -> Pin<Box<dyn Stream<Item = Result<Event, ServerError>> + Send>> {
        self.replay_with_options(last_event_id, true)
    }

    /// [`StreamHandle::replay`] with control over terminal handling. The
    /// aggregate stream interleaves many requests, so its replay must keep
    /// going past individual terminals.
    pub fn replay_with_options(
        &self,
        last_event_id: Option<String>,
        stop_at_terminal: bool,
    ) -> Pin<Box<dyn Stream<Item = Result<Event, ServerError>> + Send>> {
        let handle = self.clone();
        Box::pin(async_stream::try_stream! {
            let mut watch = handle.runtime.subscribe(&handle.record).await?;
            let mut cursor = last_event_id;
            let mut index = 0usize;

            loop {
                watch.mark_seen();
                let messages = handle.messages().await?;

                // A cursor names an event we have not located yet: skip
                // forward to just past it before yielding anything, and
                // wait if it is not visible yet.
                if let Some(last) = cursor.as_deref() {
                    match messages
                        .iter()
                        .position(|m| m.event_id.as_deref() == Some(last))
                    {
                        Some(position) => {
                            index = position + 1;
                            cursor = None;
                        }
                        None => {
                            if !watch.changed().await {
                                return;
                            }
                            continue;
                        }
                    }
                }

                while index < messages.len() {
                    let stored = &messages[index];
                    index += 1;
                    let Some(id) = stored.event_id.clone() else {
                        continue;
                    };
                    let message = stored.decode()?;
                    let terminal = stop_at_terminal && message.is_terminal();
                    yield Event { id, message };
                    if terminal {
                        return;
                    }
                }

                // A cursor can position us past the terminal (resuming
                // after the final event): nothing further will ever be
                // appended, so end rather than wait.
                if stop_at_terminal {
                    let passed_terminal = messages[..index].iter().any(|stored| {
                        stored.event_id.is_some()
                            && stored
                                .decode()
                                .map(|message| message.is_terminal())
                                .unwrap_or(false)
                    });
                    if passed_terminal {
                        return;
                    }
                }

                if !watch.changed().await {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durablemcp_protocol::jsonrpc::{
        JsonRpcNotification, JsonRpcResponse, RequestId,
    };
    use durablemcp_runtime::MemoryRuntime;
    use futures::StreamExt;
    use serde_json::json;

    fn handle() -> StreamHandle {
        let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());
        StreamHandle::new(runtime, "session", "1")
    }

    fn notification(event: &str) -> JsonRpcMessage {
        JsonRpcNotification::new(
            "notifications/progress",
            Some(json!({"progress": 0.5, "_meta": {"rebootEventId": event}})),
        )
        .into()
    }

    fn response() -> JsonRpcMessage {
        JsonRpcResponse::new(json!({"ok": true}), RequestId::Number(1)).into()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let stream = handle();
        let request = notification("r");
        stream.create(Some(&request)).await.unwrap();
        stream.create(None).await.unwrap();
        assert!(stream.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_qualifies_event_ids() {
        let stream = handle();
        stream.create(None).await.unwrap();
        stream
            .put(&notification("abc"), Some("abc"), Some("1"), None)
            .await
            .unwrap();

        let messages = stream.messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_id.as_deref(), Some("1/abc"));
        assert_eq!(messages[0].related_request_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn put_with_same_key_appends_once() {
        let stream = handle();
        stream.create(None).await.unwrap();
        for _ in 0..3 {
            stream
                .put(
                    &notification("abc"),
                    Some("abc"),
                    None,
                    Some("guard:abc".into()),
                )
                .await
                .unwrap();
        }
        assert_eq!(stream.messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_yields_suffix_in_order_and_ends_at_terminal() {
        let stream = handle();
        stream.create(None).await.unwrap();
        stream.put(&notification("a"), Some("a"), None, None).await.unwrap();
        stream.put(&notification("b"), Some("b"), None, None).await.unwrap();
        stream.put(&response(), Some("1"), None, None).await.unwrap();

        let events: Vec<_> = stream
            .replay(Some("1/a".into()))
            .map(|event| event.unwrap().id)
            .collect()
            .await;
        assert_eq!(events, vec!["1/b".to_string(), "1/1".to_string()]);
    }

    #[tokio::test]
    async fn replay_without_cursor_yields_everything() {
        let stream = handle();
        stream.create(None).await.unwrap();
        stream.put(&notification("a"), Some("a"), None, None).await.unwrap();
        stream.put(&response(), Some("1"), None, None).await.unwrap();

        let events: Vec<_> = stream
            .replay(None)
            .map(|event| event.unwrap().id)
            .collect()
            .await;
        assert_eq!(events, vec!["1/a".to_string(), "1/1".to_string()]);
    }

    #[tokio::test]
    async fn replay_skips_non_event_records() {
        let stream = handle();
        stream.create(None).await.unwrap();
        // A client response to a server-initiated request: stored, not an
        // event.
        stream.put(&response(), None, Some("1"), None).await.unwrap();
        stream.put(&notification("a"), Some("a"), None, None).await.unwrap();
        stream.put(&response(), Some("1"), None, None).await.unwrap();

        let events: Vec<_> = stream
            .replay(None)
            .map(|event| event.unwrap().id)
            .collect()
            .await;
        assert_eq!(events, vec!["1/a".to_string(), "1/1".to_string()]);
    }

    #[tokio::test]
    async fn replay_after_the_terminal_ends_immediately() {
        let stream = handle();
        stream.create(None).await.unwrap();
        stream.put(&notification("a"), Some("a"), None, None).await.unwrap();
        stream.put(&response(), Some("1"), None, None).await.unwrap();

        let events: Vec<_> = stream
            .replay(Some("1/1".into()))
            .map(|event| event.unwrap().id)
            .collect()
            .await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn replay_is_reactive() {
        let stream = handle();
        stream.create(None).await.unwrap();
        stream.put(&notification("a"), Some("a"), None, None).await.unwrap();

        let mut replay = stream.replay(None);
        assert_eq!(replay.next().await.unwrap().unwrap().id, "1/a");

        let writer = stream.clone();
        let task = tokio::spawn(async move {
            writer.put(&response(), Some("1"), None, None).await.unwrap();
        });

        assert_eq!(replay.next().await.unwrap().unwrap().id, "1/1");
        assert!(replay.next().await.is_none());
        task.await.unwrap();
    }
}
