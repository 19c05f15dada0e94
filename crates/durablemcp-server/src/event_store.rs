//! The durable event store behind the streamable-HTTP transport.
//!
//! Adapts the event log to the transport's resumability contract.
//! `store_event` derives the qualified id an outbound message will carry;
//! it does **not** write, because the session servicer writes explicitly so
//! it can commit workflow state with the same ordering.
//! `replay_events_after` streams the suffix of a request's events to a
//! reconnecting client.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use durablemcp_protocol::event_id::VSCODE_INITIAL_GET_LAST_EVENT_ID;
use durablemcp_protocol::jsonrpc::JsonRpcMessage;
use durablemcp_protocol::{
    EventId, VSCODE_GET_STREAM, derive_event_id, qualified_event_id, request_id_from_qualified,
};
use durablemcp_runtime::StateRuntime;

use crate::error::ServerError;
use crate::stream::StreamHandle;

/// The transport's resumability contract.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Derive the qualified event id an outbound message will be stored
    /// under. Does not write.
    async fn store_event(
        &self,
        stream_key: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, ServerError>;

    /// Stream events after `last_event_id` into `sender`, ending after the
    /// terminal response/error event. Returns the request id the events
    /// belong to.
    async fn replay_events_after(
        &self,
        last_event_id: &str,
        sender: mpsc::Sender<(JsonRpcMessage, EventId)>,
    ) -> Result<String, ServerError>;
}

/// [`EventStore`] over the durable per-request streams of one session.
#[derive(Clone)]
pub struct DurableEventStore {
    runtime: Arc<dyn StateRuntime>,
    session_id: String,
}

impl std::fmt::Debug for DurableEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableEventStore")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl DurableEventStore {
    /// Create the event store for one session.
    pub fn new(runtime: Arc<dyn StateRuntime>, session_id: &str) -> Self {
        Self {
            runtime,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl EventStore for DurableEventStore {
    async fn store_event(
        &self,
        stream_key: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, ServerError> {
        let event_id = derive_event_id(message)?;
        Ok(qualified_event_id(stream_key, &event_id))
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
        sender: mpsc::Sender<(JsonRpcMessage, EventId)>,
    ) -> Result<String, ServerError> {
        // The VSCode sentinel names no real event: it means "the aggregate
        // stream, from the beginning".
        let (request_key, cursor) = if last_event_id == VSCODE_INITIAL_GET_LAST_EVENT_ID {
            (VSCODE_GET_STREAM, None)
        } else {
            (
                request_id_from_qualified(last_event_id)?,
                Some(last_event_id.to_string()),
            )
        };

        let stream = StreamHandle::new(Arc::clone(&self.runtime), &self.session_id, request_key);
        stream.create(None).await?;

        // The aggregate stream interleaves terminals from many requests
        // and must keep streaming past them.
        let stop_at_terminal = request_key != VSCODE_GET_STREAM;
        let mut events = stream.replay_with_options(cursor, stop_at_terminal);
        while let Some(event) = events.next().await {
            let event = event?;
            if sender.send((event.message, event.id)).await.is_err() {
                // Client went away; it will replay again on reconnect.
                break;
            }
        }

        Ok(request_key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durablemcp_protocol::jsonrpc::{JsonRpcNotification, JsonRpcResponse, RequestId};
    use durablemcp_runtime::MemoryRuntime;
    use serde_json::json;

    fn store() -> (Arc<dyn StateRuntime>, DurableEventStore) {
        let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());
        let store = DurableEventStore::new(Arc::clone(&runtime), "session");
        (runtime, store)
    }

    #[tokio::test]
    async fn store_event_derives_without_writing() {
        let (runtime, store) = store();
        let notification: JsonRpcMessage = JsonRpcNotification::new(
            "notifications/progress",
            Some(json!({"_meta": {"rebootEventId": "abc"}})),
        )
        .into();

        let id = store.store_event("1", &notification).await.unwrap();
        assert_eq!(id, "1/abc");

        // Nothing was written.
        let stream = StreamHandle::new(runtime, "session", "1");
        assert!(stream.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_after_streams_the_suffix() {
        let (runtime, store) = store();
        let stream = StreamHandle::new(Arc::clone(&runtime), "session", "1");
        stream.create(None).await.unwrap();

        let progress: JsonRpcMessage = JsonRpcNotification::new(
            "notifications/progress",
            Some(json!({"progress": 0.5, "_meta": {"rebootEventId": "p1"}})),
        )
        .into();
        let done: JsonRpcMessage = JsonRpcResponse::new(json!(8), RequestId::Number(1)).into();
        stream.put(&progress, Some("p1"), None, None).await.unwrap();
        stream.put(&done, Some("1"), None, None).await.unwrap();

        let (sender, mut receiver) = mpsc::channel(8);
        let request_key = store.replay_events_after("1/p1", sender).await.unwrap();
        assert_eq!(request_key, "1");

        let (message, id) = receiver.recv().await.unwrap();
        assert_eq!(id, "1/1");
        assert!(message.is_terminal());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn sentinel_replays_aggregate_from_the_beginning() {
        let (runtime, store) = store();
        let aggregate = StreamHandle::new(Arc::clone(&runtime), "session", VSCODE_GET_STREAM);
        aggregate.create(None).await.unwrap();

        let progress: JsonRpcMessage = JsonRpcNotification::new(
            "notifications/progress",
            Some(json!({"progress": 0.5, "_meta": {"rebootEventId": "p1"}})),
        )
        .into();
        let done: JsonRpcMessage = JsonRpcResponse::new(json!(8), RequestId::Number(1)).into();
        aggregate.put(&progress, Some("p1"), None, None).await.unwrap();
        aggregate.put(&done, Some("1"), None, None).await.unwrap();

        let (sender, mut receiver) = mpsc::channel(8);
        // The aggregate replay never terminates on its own: it keeps
        // streaming past per-request terminals until the client goes away.
        let replay = tokio::spawn(async move {
            store
                .replay_events_after(VSCODE_INITIAL_GET_LAST_EVENT_ID, sender)
                .await
        });

        let (_, first) = receiver.recv().await.unwrap();
        assert_eq!(first, "VSCODE_GET/p1");
        let (_, second) = receiver.recv().await.unwrap();
        assert_eq!(second, "VSCODE_GET/1");

        replay.abort();
    }
}
