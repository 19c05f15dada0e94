//! Durable session metadata.
//!
//! One record per session: the ordered list of stream ids the session has
//! opened, and the client info captured exactly once from the `initialize`
//! request. The record is created on first client contact, before
//! `initialize`, and retained as long as the state runtime retains it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use durablemcp_protocol::ClientInfo;
use durablemcp_runtime::{RecordRef, RuntimeError, StateRuntime};

use crate::error::ServerError;

/// Record type holding session metadata.
pub const SESSION_RECORD_KIND: &str = "durablemcp.v1.Session";

/// The durable fields of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Stream ids opened by this session, in open order.
    #[serde(default)]
    pub stream_ids: Vec<String>,
    /// Client identification, populated once on `initialize`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Handle to one session record.
#[derive(Clone)]
pub struct SessionStateHandle {
    runtime: Arc<dyn StateRuntime>,
    record: RecordRef,
    session_id: String,
}

impl std::fmt::Debug for SessionStateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateHandle")
            .field("record", &self.record)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionStateHandle {
    /// Reference the session record for `session_id`.
    pub fn new(runtime: Arc<dyn StateRuntime>, session_id: &str) -> Self {
        Self {
            runtime,
            record: RecordRef::new(SESSION_RECORD_KIND, session_id),
            session_id: session_id.to_string(),
        }
    }

    /// The session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The record reference, also the routing identity of the session.
    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    /// Read the session, defaulting to empty for a never-written record.
    pub async fn get(&self) -> Result<SessionInfo, ServerError> {
        match self.runtime.read(&self.record).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(SessionInfo::default()),
        }
    }

    /// Append a stream id, once.
    pub async fn store_stream_id(
        &self,
        stream_id: &str,
        idempotency_key: Option<String>,
    ) -> Result<(), ServerError> {
        let stream_id = stream_id.to_string();
        self.runtime
            .commit(
                &self.record,
                idempotency_key,
                Box::new(move |value| {
                    ensure_session_record(value);
                    let streams = value
                        .get_mut("stream_ids")
                        .and_then(Value::as_array_mut)
                        .ok_or_else(|| {
                            RuntimeError::Storage("session record has no stream list".into())
                        })?;
                    if !streams.iter().any(|id| id.as_str() == Some(&stream_id)) {
                        streams.push(Value::String(stream_id));
                    }
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }

    /// Store the client info captured from `initialize`. Must be called at
    /// most once per session; a second call with different info is an
    /// invariant violation.
    pub async fn store_client_info(
        &self,
        client_info: &ClientInfo,
        idempotency_key: Option<String>,
    ) -> Result<(), ServerError> {
        let client_info = serde_json::to_value(client_info)?;
        self.runtime
            .commit(
                &self.record,
                idempotency_key,
                Box::new(move |value| {
                    ensure_session_record(value);
                    match value.get("client_info") {
                        None | Some(Value::Null) => {
                            value
                                .as_object_mut()
                                .ok_or_else(|| {
                                    RuntimeError::Storage("session record is not an object".into())
                                })?
                                .insert("client_info".into(), client_info);
                            Ok(Value::Null)
                        }
                        Some(existing) if *existing == client_info => Ok(Value::Null),
                        Some(_) => Err(RuntimeError::InvariantViolation(
                            "client_info stored more than once".into(),
                        )),
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// Non-blocking client-info read: `None` until `initialize` lands.
    pub async fn client_info(&self) -> Result<Option<ClientInfo>, ServerError> {
        Ok(self.get().await?.client_info)
    }

    /// Client-info read with bounded exponential backoff: retries while
    /// the session is not yet initialized, then gives up with `None`
    /// rather than spinning.
    pub async fn client_info_with_backoff(&self) -> Result<Option<ClientInfo>, ServerError> {
        let mut delay = Duration::from_millis(10);
        for _ in 0..8 {
            if let Some(info) = self.client_info().await? {
                return Ok(Some(info));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(500));
        }
        self.client_info().await
    }
}

fn ensure_session_record(value: &mut Value) {
    if value.is_null() {
        *value = json!({"stream_ids": []});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durablemcp_runtime::MemoryRuntime;

    fn handle() -> SessionStateHandle {
        let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());
        SessionStateHandle::new(runtime, "session-1")
    }

    fn client_info(name: &str) -> ClientInfo {
        ClientInfo {
            name: Some(name.into()),
            title: None,
            version: "1.0".into(),
        }
    }

    #[tokio::test]
    async fn fresh_session_is_empty() {
        let session = handle();
        let info = session.get().await.unwrap();
        assert!(info.stream_ids.is_empty());
        assert!(info.client_info.is_none());
    }

    #[tokio::test]
    async fn stream_ids_append_in_order_without_duplicates() {
        let session = handle();
        session.store_stream_id("s/1", None).await.unwrap();
        session.store_stream_id("s/2", None).await.unwrap();
        session.store_stream_id("s/1", None).await.unwrap();

        let info = session.get().await.unwrap();
        assert_eq!(info.stream_ids, vec!["s/1".to_string(), "s/2".to_string()]);
    }

    #[tokio::test]
    async fn client_info_is_stored_at_most_once() {
        let session = handle();
        session
            .store_client_info(&client_info("Visual Studio Code"), None)
            .await
            .unwrap();

        // Idempotent retry with identical info is fine.
        session
            .store_client_info(&client_info("Visual Studio Code"), None)
            .await
            .unwrap();

        // Different info is an invariant violation.
        let error = session
            .store_client_info(&client_info("Other"), None)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("client_info"));

        let info = session.get().await.unwrap().client_info.unwrap();
        assert!(info.is_vscode());
    }

    #[tokio::test]
    async fn backoff_read_gives_up_with_none() {
        tokio::time::pause();
        let session = handle();
        let read = tokio::spawn({
            let session = session.clone();
            async move { session.client_info_with_backoff().await.unwrap() }
        });
        // Advance through every backoff sleep.
        for _ in 0..16 {
            tokio::time::advance(Duration::from_millis(500)).await;
            tokio::task::yield_now().await;
        }
        assert!(read.await.unwrap().is_none());
    }
}
