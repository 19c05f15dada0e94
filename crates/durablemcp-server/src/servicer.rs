//! The session servicer.
//!
//! One servicer per live session, on the replica that owns the session
//! record. It owns the non-durable half of the system: the refcounted
//! channel pairs connecting the embedded engine to the pump, and the
//! mapping from server-minted request ids to the requests that issued
//! them. Everything durable (the request streams, the session record, the
//! workflow checkpoints) lives behind the state runtime, which is what
//! makes a replica replaceable.
//!
//! A request flows through two workflows:
//!
//! - `HandleMessage` persists the request, spawns `Run`, and pumps
//!   engine output into the stream (`at_least_once("Send and receive")`).
//! - `Run` drives the engine itself (`at_least_once("Server run")`),
//!   cancelling any server-initiated requests left dangling by a previous
//!   life before dispatch re-enters the handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use durablemcp_protocol::VSCODE_GET_STREAM;
use durablemcp_protocol::event_id::deterministic_event_id;
use durablemcp_protocol::jsonrpc::{JsonRpcMessage, JsonRpcNotification, RequestId};
use durablemcp_protocol::types::{CancelledParams, Meta, methods};
use durablemcp_protocol::derive_event_id;
use durablemcp_runtime::{StateRuntime, WorkflowContext, at_least_once};

use crate::engine::{CHANNEL_CAPACITY, McpEngine, OutboundMessage};
use crate::envelope::MessageEnvelope;
use crate::error::ServerError;
use crate::registry::Registry;
use crate::session_state::SessionStateHandle;
use crate::stream::StreamHandle;

struct RequestChannels {
    refs: usize,
    to_engine: mpsc::Sender<MessageEnvelope>,
    to_engine_receiver: Option<mpsc::Receiver<MessageEnvelope>>,
    from_engine: mpsc::Sender<OutboundMessage>,
    from_engine_receiver: Option<mpsc::Receiver<OutboundMessage>>,
}

struct WriteRequestMapping {
    server_request_id: RequestId,
    related_request_id: String,
}

/// Owns the in-memory side of one session and routes its messages.
pub struct SessionServicer {
    runtime: Arc<dyn StateRuntime>,
    session_id: String,
    engine: McpEngine,
    session_state: SessionStateHandle,
    request_channels: Mutex<HashMap<String, RequestChannels>>,
    write_request_ids: DashMap<String, WriteRequestMapping>,
    is_vscode: Mutex<Option<bool>>,
}

impl SessionServicer {
    /// Create the servicer for one session.
    pub fn new(
        runtime: Arc<dyn StateRuntime>,
        session_id: &str,
        registry: Arc<Registry>,
        effect_validation: bool,
    ) -> Self {
        Self {
            session_state: SessionStateHandle::new(Arc::clone(&runtime), session_id),
            runtime,
            session_id: session_id.to_string(),
            engine: McpEngine::new(registry, effect_validation),
            request_channels: Mutex::new(HashMap::new()),
            write_request_ids: DashMap::new(),
            is_vscode: Mutex::new(None),
        }
    }

    /// The session this servicer owns.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The durable session record.
    pub fn session_state(&self) -> &SessionStateHandle {
        &self.session_state
    }

    /// Memoized, non-blocking VSCode check: `false` while `client_info`
    /// is not yet populated, never spinning.
    pub async fn is_vscode(&self) -> bool {
        if let Some(known) = *self.is_vscode.lock() {
            return known;
        }
        match self.session_state.client_info().await {
            Ok(Some(info)) => {
                let vscode = info.is_vscode();
                *self.is_vscode.lock() = Some(vscode);
                vscode
            }
            _ => false,
        }
    }

    fn acquire_channels(self: &Arc<Self>, request_key: &str) -> ChannelsGuard {
        let mut channels = self.request_channels.lock();
        channels
            .entry(request_key.to_string())
            .and_modify(|entry| entry.refs += 1)
            .or_insert_with(|| {
                let (to_engine, to_engine_receiver) = mpsc::channel(CHANNEL_CAPACITY);
                // Capacity 1 keeps the engine from racing far ahead of the
                // durable appends the pump performs.
                let (from_engine, from_engine_receiver) = mpsc::channel(1);
                RequestChannels {
                    refs: 1,
                    to_engine,
                    to_engine_receiver: Some(to_engine_receiver),
                    from_engine,
                    from_engine_receiver: Some(from_engine_receiver),
                }
            });
        ChannelsGuard {
            servicer: Arc::clone(self),
            request_key: request_key.to_string(),
        }
    }

    fn stream(&self, request_key: &str) -> StreamHandle {
        StreamHandle::new(Arc::clone(&self.runtime), &self.session_id, request_key)
    }

    fn aggregate_stream(&self) -> StreamHandle {
        self.stream(VSCODE_GET_STREAM)
    }

    /// Handle one inbound message from the transport.
    pub async fn handle_message(
        self: Arc<Self>,
        envelope: MessageEnvelope,
    ) -> Result<(), ServerError> {
        match &envelope.message {
            JsonRpcMessage::Request(request) => {
                let request_key = request.id.canonical();
                tracing::debug!(
                    session = %self.session_id,
                    request = %request_key,
                    method = %request.method,
                    "handling request"
                );
                self.handle_request(request_key, envelope).await
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification.clone(), envelope).await
            }
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                self.handle_client_response(envelope).await
            }
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        request_key: String,
        envelope: MessageEnvelope,
    ) -> Result<(), ServerError> {
        let context = WorkflowContext::new(Arc::clone(&self.runtime), &self.session_id, &request_key);

        let stream = self.stream(&request_key);
        self.session_state
            .store_stream_id(
                stream.stream_id(),
                Some(context.per_workflow_key("store_stream_id")),
            )
            .await?;
        stream.create(Some(&envelope.message)).await?;

        // A re-delivered request whose stream already holds its terminal
        // is fully serviced; replay serves the client.
        let already_complete = stream.messages().await?.iter().any(|stored| {
            stored.event_id.is_some()
                && stored
                    .decode()
                    .map(|message| message.is_terminal())
                    .unwrap_or(false)
        });
        if already_complete {
            tracing::debug!(request = %request_key, "request already complete");
            return Ok(());
        }

        let guard = self.acquire_channels(&request_key);
        let (to_engine, receiver) = {
            let mut channels = self.request_channels.lock();
            let entry = channels
                .get_mut(&request_key)
                .expect("channels acquired above");
            (entry.to_engine.clone(), entry.from_engine_receiver.take())
        };
        let Some(mut receiver) = receiver else {
            // Another HandleMessage for this request is already pumping;
            // the durable stream serves this delivery.
            tracing::debug!(request = %request_key, "request already being pumped");
            return Ok(());
        };

        let run_task = tokio::spawn(Arc::clone(&self).run(envelope.clone()));

        let pump = {
            let servicer = Arc::clone(&self);
            let context = context.clone();
            let stream = stream.clone();
            let request_key = request_key.clone();
            || async move {
                to_engine
                    .send(envelope)
                    .await
                    .map_err(|_| ServerError::ChannelClosed.into_runtime())?;

                while let Some(outbound) = receiver.recv().await {
                    let terminal = servicer
                        .record_outbound(&context, &stream, &request_key, outbound)
                        .await
                        .map_err(ServerError::into_runtime)?;
                    if terminal {
                        break;
                    }
                }
                Ok(())
            }
        };

        at_least_once("Send and receive", &context, pump).await?;

        match run_task.await {
            Ok(result) => result?,
            Err(join_error) => {
                return Err(ServerError::handler(format!("run task failed: {join_error}")));
            }
        }

        tracing::debug!(session = %self.session_id, request = %request_key, "request completed");
        drop(guard);
        Ok(())
    }

    /// Persist one outbound engine message and release it to any attached
    /// stream. Returns whether the message was terminal.
    async fn record_outbound(
        &self,
        context: &WorkflowContext,
        stream: &StreamHandle,
        request_key: &str,
        outbound: OutboundMessage,
    ) -> Result<bool, ServerError> {
        let mut message = outbound.message;
        let event_id = derive_event_id(&message)?;

        if let JsonRpcMessage::Request(request) = &mut message {
            // Server-initiated: remember the minted id so the client's
            // response can be swapped back, and make the outbound id the
            // event id so it is routable across reconnects.
            self.write_request_ids.insert(
                event_id.clone(),
                WriteRequestMapping {
                    server_request_id: request.id.clone(),
                    related_request_id: request_key.to_string(),
                },
            );
            request.id = RequestId::String(event_id.clone());
        }

        let related = outbound.related_request_id.as_deref();
        stream
            .put(
                &message,
                Some(&event_id),
                related,
                Some(context.per_workflow_key(&format!("put:{event_id}"))),
            )
            .await?;

        if self.is_vscode().await {
            self.aggregate_stream()
                .put(
                    &message,
                    Some(&event_id),
                    related,
                    Some(context.per_workflow_key(&format!("put:{VSCODE_GET_STREAM}:{event_id}"))),
                )
                .await?;
        }

        Ok(message.is_terminal())
    }

    /// Drive the engine for one request (`at_least_once("Server run")`),
    /// cancelling outstanding server-initiated requests first.
    pub async fn run(self: Arc<Self>, envelope: MessageEnvelope) -> Result<(), ServerError> {
        let JsonRpcMessage::Request(request) = &envelope.message else {
            tracing::debug!("run invoked without a request");
            return Ok(());
        };
        let request_key = request.id.canonical();
        let context = WorkflowContext::new(Arc::clone(&self.runtime), &self.session_id, &request_key);

        let guard = self.acquire_channels(&request_key);
        let (receiver, from_engine) = {
            let mut channels = self.request_channels.lock();
            let entry = channels
                .get_mut(&request_key)
                .expect("channels acquired above");
            (entry.to_engine_receiver.take(), entry.from_engine.clone())
        };
        let Some(receiver) = receiver else {
            tracing::debug!(request = %request_key, "engine already running for request");
            return Ok(());
        };

        let server_run = {
            let servicer = Arc::clone(&self);
            let context = context.clone();
            let request_key = request_key.clone();
            || async move {
                servicer
                    .cancel_outstanding_requests(&context, &request_key)
                    .await
                    .map_err(ServerError::into_runtime)?;

                servicer
                    .engine
                    .run(
                        context.clone(),
                        servicer.session_state.clone(),
                        receiver,
                        from_engine,
                    )
                    .await
                    .map_err(ServerError::into_runtime)
            }
        };

        at_least_once("Server run", &context, server_run).await?;
        drop(guard);
        Ok(())
    }

    /// Find server-initiated requests stored on the stream with no stored
    /// client response and append a cancellation event for each, so a
    /// replaying client knows not to answer them and the handler's
    /// re-execution can re-issue them.
    async fn cancel_outstanding_requests(
        &self,
        context: &WorkflowContext,
        request_key: &str,
    ) -> Result<(), ServerError> {
        let stream = self.stream(request_key);
        let messages = stream.messages().await?;

        let mut outstanding: Vec<String> = Vec::new();
        for stored in &messages {
            let Ok(message) = stored.decode() else {
                continue;
            };
            match message {
                JsonRpcMessage::Request(request) if stored.event_id.is_some() => {
                    outstanding.push(request.id.canonical());
                }
                // Client answers are stored without an event id.
                JsonRpcMessage::Response(response) if stored.event_id.is_none() => {
                    if let Some(id) = response.id.as_request_id() {
                        outstanding.retain(|minted| *minted != id.canonical());
                    }
                }
                JsonRpcMessage::Error(error) if stored.event_id.is_none() => {
                    if let Some(id) = error.id.as_request_id() {
                        outstanding.retain(|minted| *minted != id.canonical());
                    }
                }
                _ => {}
            }
        }

        for minted in outstanding {
            tracing::debug!(
                session = %self.session_id,
                request = %request_key,
                minted,
                "cancelling outstanding server-initiated request"
            );
            let event_id = deterministic_event_id(
                &context.workflow_id(),
                &format!("cancel_outstanding: {minted}"),
            );
            let params = CancelledParams {
                request_id: RequestId::String(minted),
                reason: Some("server restarted".to_string()),
                meta: Some(Meta {
                    reboot_event_id: Some(event_id.clone()),
                    progress_token: None,
                }),
            };
            let notification: JsonRpcMessage =
                JsonRpcNotification::new(methods::CANCELLED, Some(serde_json::to_value(params)?))
                    .into();

            stream
                .put(
                    &notification,
                    Some(&event_id),
                    Some(request_key),
                    Some(context.per_workflow_key(&format!("put:{event_id}"))),
                )
                .await?;
            if self.is_vscode().await {
                self.aggregate_stream()
                    .put(
                        &notification,
                        Some(&event_id),
                        Some(request_key),
                        Some(
                            context
                                .per_workflow_key(&format!("put:{VSCODE_GET_STREAM}:{event_id}")),
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_notification(
        self: Arc<Self>,
        notification: JsonRpcNotification,
        envelope: MessageEnvelope,
    ) -> Result<(), ServerError> {
        if notification.method == methods::INITIALIZED {
            // Handlers run stateless; the handshake acknowledgement has
            // nothing to update.
            tracing::debug!(session = %self.session_id, "ignoring notifications/initialized");
            return Ok(());
        }

        let related = envelope
            .related_request_id
            .clone()
            .or_else(|| match notification.method.as_str() {
                methods::CANCELLED => serde_json::from_value::<CancelledParams>(
                    notification.params.clone().unwrap_or_default(),
                )
                .ok()
                .map(|params| params.request_id.canonical()),
                _ => None,
            });

        let sender = related.as_deref().and_then(|request_key| {
            let channels = self.request_channels.lock();
            channels
                .get(request_key)
                .map(|entry| entry.to_engine.clone())
        });

        match sender {
            Some(sender) => {
                if sender.send(envelope).await.is_err() {
                    tracing::debug!(
                        method = %notification.method,
                        "request finished before notification could be routed"
                    );
                }
            }
            None => {
                tracing::debug!(
                    session = %self.session_id,
                    method = %notification.method,
                    "dropping notification with no live request"
                );
            }
        }
        Ok(())
    }

    /// A client's response to a server-initiated request: swap the minted
    /// event id back to the original server-side id and feed it to the
    /// related request's engine.
    async fn handle_client_response(
        self: Arc<Self>,
        mut envelope: MessageEnvelope,
    ) -> Result<(), ServerError> {
        let minted = match &envelope.message {
            JsonRpcMessage::Response(response) => {
                response.id.as_request_id().map(|id| id.canonical())
            }
            JsonRpcMessage::Error(error) => error.id.as_request_id().map(|id| id.canonical()),
            _ => None,
        };
        let Some(minted) = minted else {
            tracing::debug!("dropping response without an id");
            return Ok(());
        };

        let Some((_, mapping)) = self.write_request_ids.remove(&minted) else {
            // The process restarted since the request went out; the
            // handler will re-issue it on re-entry.
            tracing::warn!(
                session = %self.session_id,
                minted,
                "response for unknown server-initiated request, dropping"
            );
            return Ok(());
        };

        // Record the raw answer on the stream so cancellation recovery
        // can tell answered requests from outstanding ones.
        self.stream(&mapping.related_request_id)
            .put(
                &envelope.message,
                None,
                Some(&mapping.related_request_id),
                None,
            )
            .await?;

        match &mut envelope.message {
            JsonRpcMessage::Response(response) => {
                response.id = durablemcp_protocol::jsonrpc::ResponseId::from_request(
                    mapping.server_request_id.clone(),
                );
            }
            JsonRpcMessage::Error(error) => {
                error.id = durablemcp_protocol::jsonrpc::ResponseId::from_request(
                    mapping.server_request_id.clone(),
                );
            }
            _ => {}
        }

        let sender = {
            let channels = self.request_channels.lock();
            channels
                .get(&mapping.related_request_id)
                .map(|entry| entry.to_engine.clone())
        };
        match sender {
            Some(sender) => {
                if sender.send(envelope).await.is_err() {
                    tracing::debug!(minted, "request finished before response could be delivered");
                }
            }
            None => {
                tracing::warn!(minted, "no live request for server-request response, dropping");
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SessionServicer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServicer")
            .field("session_id", &self.session_id)
            .field("live_requests", &self.request_channels.lock().len())
            .finish()
    }
}

struct ChannelsGuard {
    servicer: Arc<SessionServicer>,
    request_key: String,
}

impl Drop for ChannelsGuard {
    fn drop(&mut self) {
        let mut channels = self.servicer.request_channels.lock();
        if let Some(entry) = channels.get_mut(&self.request_key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                channels.remove(&self.request_key);
            }
        }
    }
}
