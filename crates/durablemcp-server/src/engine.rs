//! The embedded MCP protocol engine.
//!
//! One engine run drives a single inbound request to completion over a
//! pair of in-memory channels: client-to-server messages arrive on the
//! inbound receiver (the initial request, then any responses to
//! server-initiated requests), and everything server-to-client (progress,
//! log messages, elicitation requests, the final response) goes out the
//! outbound sender for the session servicer to persist and release.
//!
//! The engine is stateless across requests: `initialize` is answered from
//! the registry every time, which is what lets a resumed request run
//! without the client re-initializing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use durablemcp_protocol::jsonrpc::{
    ErrorObject, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
use durablemcp_protocol::types::{
    CallToolParams, CallToolResult, CancelledParams, ClientInfo, GetPromptResult,
    InitializeParams, InitializeResult, ResourceContents, methods, progress_token,
};
use durablemcp_protocol::PROTOCOL_VERSION;
use durablemcp_runtime::WorkflowContext;

use crate::adapter::{self, DurableContext};
use crate::auth::AccessToken;
use crate::envelope::MessageEnvelope;
use crate::error::ServerError;
use crate::registry::Registry;
use crate::session_state::SessionStateHandle;

/// Capacity of the per-request channel pairs.
pub const CHANNEL_CAPACITY: usize = 64;

/// One server-to-client message with its originating request.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// The message.
    pub message: JsonRpcMessage,
    /// Id of the inbound request this message relates to. `None` for the
    /// final response, whose own id already routes it.
    pub related_request_id: Option<String>,
}

#[derive(Debug)]
enum RequestOutcome {
    Result(Value),
    Error(ErrorObject),
    Cancelled,
}

/// Handle handed to the adapter for server-initiated traffic: outbound
/// sends plus request/response correlation.
#[derive(Clone)]
pub struct ServerSession {
    outbound: mpsc::Sender<OutboundMessage>,
    pending: Arc<DashMap<String, oneshot::Sender<RequestOutcome>>>,
    next_request_id: Arc<AtomicI64>,
    related_request_id: String,
    tolerate_closed: Arc<AtomicBool>,
}

impl ServerSession {
    fn new(outbound: mpsc::Sender<OutboundMessage>, related_request_id: String) -> Self {
        Self {
            outbound,
            pending: Arc::new(DashMap::new()),
            next_request_id: Arc::new(AtomicI64::new(0)),
            related_request_id,
            tolerate_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// During an effect-validation re-run the transport side may already
    /// be gone; sends then tolerate a closed channel.
    pub(crate) fn set_tolerate_closed(&self, tolerate: bool) {
        self.tolerate_closed.store(tolerate, Ordering::Relaxed);
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), ServerError> {
        if self.outbound.send(message).await.is_err() {
            if self.tolerate_closed.load(Ordering::Relaxed) {
                tracing::trace!("ignoring send on closed channel during effect validation");
                return Ok(());
            }
            return Err(ServerError::ChannelClosed);
        }
        Ok(())
    }

    /// Send a notification related to the current request.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), ServerError> {
        self.send(OutboundMessage {
            message: JsonRpcNotification::new(method, Some(params)).into(),
            related_request_id: Some(self.related_request_id.clone()),
        })
        .await
    }

    /// Send a server-initiated request and wait for the client's answer.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, ServerError> {
        let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id.canonical(), sender);

        self.send(OutboundMessage {
            message: JsonRpcRequest::new(method, Some(params), id).into(),
            related_request_id: Some(self.related_request_id.clone()),
        })
        .await?;

        match receiver.await {
            Ok(RequestOutcome::Result(value)) => Ok(value),
            Ok(RequestOutcome::Error(error)) => Err(ServerError::handler(format!(
                "client returned error {}: {}",
                error.code, error.message
            ))),
            Ok(RequestOutcome::Cancelled) | Err(_) => Err(ServerError::RequestCancelled),
        }
    }

    fn complete(&self, id: &str, outcome: RequestOutcome) {
        match self.pending.remove(id) {
            Some((_, sender)) => {
                let _ = sender.send(outcome);
            }
            None => {
                tracing::debug!(id, "response for unknown server-initiated request, dropping");
            }
        }
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("related_request_id", &self.related_request_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// The engine: registry plus dispatch.
#[derive(Debug, Clone)]
pub struct McpEngine {
    registry: Arc<Registry>,
    effect_validation: bool,
}

impl McpEngine {
    /// Create an engine over a registry.
    pub fn new(registry: Arc<Registry>, effect_validation: bool) -> Self {
        Self {
            registry,
            effect_validation,
        }
    }

    /// Drive one inbound request to completion.
    ///
    /// Consumes envelopes from `inbound` (the request first, then client
    /// responses and cancellations for server-initiated requests) and
    /// emits every server-to-client message on `outbound`, ending with
    /// exactly one final response or error.
    pub async fn run(
        &self,
        context: WorkflowContext,
        session_state: SessionStateHandle,
        mut inbound: mpsc::Receiver<MessageEnvelope>,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Result<(), ServerError> {
        let Some(first) = inbound.recv().await else {
            tracing::debug!("engine channel closed before a request arrived");
            return Ok(());
        };

        let JsonRpcMessage::Request(request) = first.message else {
            tracing::debug!(method = ?first.message.method(), "engine received a non-request first");
            return Ok(());
        };

        let session = ServerSession::new(outbound.clone(), request.id.canonical());
        let access_token = first.access_token;

        let mut dispatch = Box::pin(self.dispatch(
            context,
            session.clone(),
            session_state,
            request,
            access_token,
        ));

        let mut inbound_open = true;
        let final_message = loop {
            tokio::select! {
                message = &mut dispatch => break message,
                envelope = inbound.recv(), if inbound_open => {
                    match envelope {
                        Some(envelope) => route_inbound(&session, envelope),
                        None => inbound_open = false,
                    }
                }
            }
        };

        outbound
            .send(OutboundMessage {
                message: final_message,
                related_request_id: None,
            })
            .await
            .map_err(|_| ServerError::ChannelClosed)?;

        Ok(())
    }

    async fn dispatch(
        &self,
        context: WorkflowContext,
        session: ServerSession,
        session_state: SessionStateHandle,
        request: JsonRpcRequest,
        access_token: Option<AccessToken>,
    ) -> JsonRpcMessage {
        let id = request.id.clone();
        let outcome = self
            .dispatch_inner(context, session, session_state, &request, access_token)
            .await;
        match outcome {
            Ok(result) => JsonRpcResponse::new(result, id).into(),
            Err(error) => {
                tracing::debug!(method = %request.method, %error, "request failed");
                JsonRpcError::new(error.jsonrpc_code(), error.to_string(), id).into()
            }
        }
    }

    async fn dispatch_inner(
        &self,
        context: WorkflowContext,
        session: ServerSession,
        session_state: SessionStateHandle,
        request: &JsonRpcRequest,
        access_token: Option<AccessToken>,
    ) -> Result<Value, ServerError> {
        let make_context = || {
            DurableContext::new(
                context.clone(),
                session.clone(),
                access_token.clone(),
                progress_token(request.params.as_ref()),
            )
        };

        match request.method.as_str() {
            methods::INITIALIZE => {
                let params: InitializeParams = parse_params(request.params.clone())?;
                self.initialize(&context, &session_state, params.client_info)
                    .await
            }
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let tools: Vec<_> = self.registry.tools.iter().map(|t| &t.tool).collect();
                Ok(json!({"tools": tools}))
            }
            methods::TOOLS_CALL => {
                let params: CallToolParams = parse_params(request.params.clone())?;
                let Some(registration) = self.registry.tool(&params.name) else {
                    return Err(ServerError::UnknownTool { name: params.name });
                };
                let result = adapter::call_tool(
                    registration,
                    params.arguments,
                    make_context(),
                    self.effect_validation,
                )
                .await?;
                Ok(serde_json::to_value(CallToolResult::structured(result))?)
            }
            methods::RESOURCES_LIST => {
                let resources: Vec<_> =
                    self.registry.resources.iter().map(|r| &r.resource).collect();
                Ok(json!({"resources": resources}))
            }
            methods::RESOURCES_TEMPLATES_LIST => {
                let templates: Vec<_> =
                    self.registry.templates.iter().map(|t| &t.template).collect();
                Ok(json!({"resourceTemplates": templates}))
            }
            methods::RESOURCES_READ => {
                let uri = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServerError::invalid_params("missing 'uri'"))?
                    .to_string();
                let Some((handler, params, mime_type)) = self.registry.resolve_resource(&uri)
                else {
                    return Err(ServerError::UnknownResource { uri });
                };
                let text = handler(params, make_context()).await?;
                let contents = ResourceContents {
                    uri,
                    mime_type,
                    text,
                };
                Ok(json!({"contents": [contents]}))
            }
            methods::PROMPTS_LIST => {
                let prompts: Vec<_> = self.registry.prompts.iter().map(|p| &p.prompt).collect();
                Ok(json!({"prompts": prompts}))
            }
            methods::PROMPTS_GET => {
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServerError::invalid_params("missing 'name'"))?
                    .to_string();
                let arguments = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let Some(registration) = self.registry.prompt(&name) else {
                    return Err(ServerError::UnknownPrompt { name });
                };
                let messages = (registration.handler)(arguments, make_context()).await?;
                let result = GetPromptResult {
                    description: registration.prompt.description.clone(),
                    messages,
                };
                Ok(serde_json::to_value(result)?)
            }
            method => Err(ServerError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    async fn initialize(
        &self,
        context: &WorkflowContext,
        session_state: &SessionStateHandle,
        client_info: ClientInfo,
    ) -> Result<Value, ServerError> {
        session_state
            .store_client_info(
                &client_info,
                Some(context.per_workflow_key("store_client_info")),
            )
            .await?;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.registry.capabilities(),
            server_info: self.registry.server_info.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }
}

fn route_inbound(session: &ServerSession, envelope: MessageEnvelope) {
    match envelope.message {
        JsonRpcMessage::Response(response) => {
            if let Some(id) = response.id.as_request_id() {
                session.complete(&id.canonical(), RequestOutcome::Result(response.result));
            }
        }
        JsonRpcMessage::Error(error) => {
            if let Some(id) = error.id.as_request_id() {
                session.complete(&id.canonical(), RequestOutcome::Error(error.error));
            }
        }
        JsonRpcMessage::Notification(notification)
            if notification.method == methods::CANCELLED =>
        {
            match serde_json::from_value::<CancelledParams>(
                notification.params.clone().unwrap_or(Value::Null),
            ) {
                Ok(params) => {
                    session.complete(&params.request_id.canonical(), RequestOutcome::Cancelled);
                }
                Err(error) => {
                    tracing::debug!(%error, "malformed cancellation notification");
                }
            }
        }
        other => {
            tracing::debug!(method = ?other.method(), "engine dropping unexpected inbound");
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, ServerError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|error| ServerError::invalid_params(error.to_string()))
}
