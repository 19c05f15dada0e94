//! The session-routed streamable-HTTP front-end.
//!
//! Every long-lived logical session maps onto a single owning replica. A
//! request arriving without the routing header gets one attached, minting
//! a UUIDv7 session id if the client has none yet, and is forwarded
//! upstream so routing lands it on the replica that owns the session
//! record; on the owning replica the request reaches the per-session
//! transport, which terminates HTTP/SSE and feeds the session servicer.
//!
//! VSCode consumes all events through a single GET stream and treats POST
//! SSE bodies as optional, so for that client POST SSE bodies are dropped
//! (the events having been duplicated onto the aggregate stream on write)
//! and a GET without a `Last-Event-ID` gets the sentinel injected so it
//! always replays the aggregate stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use durablemcp_protocol::event_id::VSCODE_INITIAL_GET_LAST_EVENT_ID;
use durablemcp_protocol::jsonrpc::{JsonRpcError, JsonRpcMessage};
use durablemcp_protocol::{
    LAST_EVENT_ID_HEADER, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER, PROTOCOL_VERSION,
};
use durablemcp_runtime::{RecordRef, StateRuntime};

use crate::auth::AccessToken;
use crate::envelope::MessageEnvelope;
use crate::error::ServerError;
use crate::event_store::{DurableEventStore, EventStore};
use crate::registry::Registry;
use crate::servicer::SessionServicer;
use crate::session_state::SESSION_RECORD_KIND;

/// Header carrying the routing identity of the session record.
pub const STATE_REF_HEADER: &str = "x-durablemcp-state-ref";

/// Header pinning a request to a specific replica; stripped before
/// re-routing so the session record decides placement.
pub const REPLICA_ID_HEADER: &str = "x-durablemcp-replica";

/// Shared state of the front-end: the owning-replica side of every live
/// session plus the proxy client for sessions owned elsewhere.
#[derive(Clone)]
pub struct McpService {
    runtime: Arc<dyn StateRuntime>,
    registry: Arc<Registry>,
    effect_validation: bool,
    servicers: Arc<DashMap<String, Arc<SessionServicer>>>,
    proxy: reqwest::Client,
}

impl std::fmt::Debug for McpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpService")
            .field("live_sessions", &self.servicers.len())
            .finish()
    }
}

impl McpService {
    /// Create the front-end state.
    pub fn new(
        runtime: Arc<dyn StateRuntime>,
        registry: Arc<Registry>,
        effect_validation: bool,
    ) -> Self {
        Self {
            runtime,
            registry,
            effect_validation,
            servicers: Arc::new(DashMap::new()),
            proxy: reqwest::Client::new(),
        }
    }

    /// The axum router for the MCP endpoint at `path`.
    pub fn router(self, path: &str) -> Router {
        Router::new().route(path, any(handle)).with_state(self)
    }

    fn servicer(&self, session_id: &str) -> Arc<SessionServicer> {
        self.servicers
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionServicer::new(
                    Arc::clone(&self.runtime),
                    session_id,
                    Arc::clone(&self.registry),
                    self.effect_validation,
                ))
            })
            .clone()
    }
}

async fn handle(State(state): State<McpService>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    let had_session_header = parts.headers.contains_key(MCP_SESSION_ID_HEADER);

    // First contact with this request: attach the routing identity and let
    // the session record decide which replica serves it.
    if !parts.headers.contains_key(STATE_REF_HEADER) {
        let session_id = parts
            .headers
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::now_v7().simple().to_string());

        let record = RecordRef::new(SESSION_RECORD_KIND, &session_id);
        match HeaderValue::from_str(&record.to_string()) {
            Ok(value) => {
                parts.headers.insert(STATE_REF_HEADER, value);
            }
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "invalid session id").into_response();
            }
        }
        parts.headers.remove(REPLICA_ID_HEADER);

        if let Some(upstream) = state.runtime.route(&record) {
            return proxy(&state, upstream, parts, body).await;
        }
        // This replica owns the record; fall through and serve it.
    }

    let session_id = match session_id_from_headers(&parts.headers) {
        Some(session_id) => session_id,
        None => return (StatusCode::BAD_REQUEST, "missing session identity").into_response(),
    };

    let access_token = parts.extensions.get::<AccessToken>().cloned();
    let servicer = state.servicer(&session_id);

    if parts.method == Method::POST {
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(error) => {
                return (StatusCode::BAD_REQUEST, format!("body error: {error}")).into_response();
            }
        };
        handle_post(&state, servicer, &session_id, &body, access_token).await
    } else if parts.method == Method::GET {
        if !had_session_header {
            return (StatusCode::BAD_REQUEST, "GET requires a session").into_response();
        }
        handle_get(&state, servicer, &session_id, &parts.headers).await
    } else if parts.method == Method::DELETE {
        state.servicers.remove(&session_id);
        tracing::debug!(session = %session_id, "session terminated");
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(session_id) = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(session_id.to_string());
    }
    // A new session carries its identity only in the routing header.
    let reference = headers.get(STATE_REF_HEADER)?.to_str().ok()?;
    Some(RecordRef::from_readable(reference)?.id)
}

async fn handle_post(
    state: &McpService,
    servicer: Arc<SessionServicer>,
    session_id: &str,
    body: &[u8],
    access_token: Option<AccessToken>,
) -> Response {
    let message: JsonRpcMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(error) => {
            let error = JsonRpcError::parse_error(error.to_string());
            let body = serde_json::to_string(&error).unwrap_or_default();
            return (StatusCode::BAD_REQUEST, mcp_headers(session_id), body).into_response();
        }
    };

    match &message {
        JsonRpcMessage::Request(request) => {
            let request_key = request.id.canonical();
            let envelope = MessageEnvelope::new(message.clone())
                .with_related_request_id(&request_key)
                .with_access_token(access_token);

            spawn_handle(Arc::clone(&servicer), envelope);

            // VSCode consumes everything via the aggregate GET stream;
            // drop the POST SSE body after the status line.
            if servicer.is_vscode().await {
                return sse_response(session_id, futures::stream::empty());
            }

            let stream = crate::stream::StreamHandle::new(
                Arc::clone(&state.runtime),
                session_id,
                &request_key,
            );
            let events = stream.replay(None).filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event_to_sse((event.message, event.id))),
                    Err(error) => {
                        tracing::debug!(%error, "post stream replay ended with error");
                        None
                    }
                }
            });
            sse_response(session_id, events)
        }
        JsonRpcMessage::Notification(_) | JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
            let envelope = MessageEnvelope::new(message).with_access_token(access_token);
            spawn_handle(servicer, envelope);
            (StatusCode::ACCEPTED, mcp_headers(session_id)).into_response()
        }
    }
}

async fn handle_get(
    state: &McpService,
    servicer: Arc<SessionServicer>,
    session_id: &str,
    headers: &HeaderMap,
) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !accept.contains("text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let mut last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    if last_event_id.is_none() {
        // VSCode always replays from the aggregate stream; detecting it
        // may require waiting briefly for `initialize` to land.
        let is_vscode = servicer
            .session_state()
            .client_info_with_backoff()
            .await
            .ok()
            .flatten()
            .is_some_and(|info| info.is_vscode());
        if is_vscode {
            last_event_id = Some(VSCODE_INITIAL_GET_LAST_EVENT_ID.to_string());
        }
    }

    let Some(last_event_id) = last_event_id else {
        // Nothing to replay and no aggregate stream to follow: hold the
        // stream open for keep-alives.
        return sse_response(session_id, futures::stream::pending());
    };

    let store = DurableEventStore::new(Arc::clone(&state.runtime), session_id);
    let (sender, receiver) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(error) = store.replay_events_after(&last_event_id, sender).await {
            tracing::debug!(%error, "get stream replay ended with error");
        }
    });
    sse_response(
        session_id,
        tokio_stream::wrappers::ReceiverStream::new(receiver).map(event_to_sse),
    )
}

fn spawn_handle(servicer: Arc<SessionServicer>, envelope: MessageEnvelope) {
    tokio::spawn(async move {
        if let Err(error) = servicer.handle_message(envelope).await {
            tracing::warn!(%error, "message handling failed");
        }
    });
}

fn event_to_sse((message, id): (JsonRpcMessage, String)) -> Result<SseEvent, Infallible> {
    let data = serde_json::to_string(&message).unwrap_or_default();
    Ok(SseEvent::default().id(id).data(data))
}

fn mcp_headers(session_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(session_id) {
        headers.insert(MCP_SESSION_ID_HEADER, value);
    }
    headers.insert(
        MCP_PROTOCOL_VERSION_HEADER,
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    headers
}

fn sse_response<S>(session_id: &str, stream: S) -> Response
where
    S: futures::Stream<Item = Result<SseEvent, Infallible>> + Send + 'static,
{
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    response.headers_mut().extend(mcp_headers(session_id));
    response
}

async fn proxy(
    state: &McpService,
    upstream: String,
    parts: http::request::Parts,
    body: Body,
) -> Response {
    match proxy_inner(state, upstream, parts, body).await {
        Ok(response) => response,
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Proxy request failed: {error}"),
        )
            .into_response(),
    }
}

async fn proxy_inner(
    state: &McpService,
    upstream: String,
    parts: http::request::Parts,
    body: Body,
) -> Result<Response, ServerError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://{upstream}{path_and_query}");

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|error| ServerError::Proxy {
            message: error.to_string(),
        })?;

    let mut request = state
        .proxy
        .request(parts.method.clone(), &url)
        .body(body.to_vec());
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request = request.header(name.as_str(), value);
        }
    }

    // No timeout: this may be a long-lived GET streaming server-sent
    // events.
    let upstream_response = request.send().await.map_err(|error| ServerError::Proxy {
        message: error.to_string(),
    })?;

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }

    let stream = upstream_response.bytes_stream();
    builder
        .body(Body::from_stream(stream))
        .map_err(|error| ServerError::Proxy {
            message: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_identity_prefers_the_mcp_header() {
        let mut headers = HeaderMap::new();
        headers.insert(MCP_SESSION_ID_HEADER, HeaderValue::from_static("abc"));
        headers.insert(
            STATE_REF_HEADER,
            HeaderValue::from_static("durablemcp.v1.Session:other"),
        );
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn session_identity_falls_back_to_the_routing_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            STATE_REF_HEADER,
            HeaderValue::from_static("durablemcp.v1.Session:minted"),
        );
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("minted"));
        assert_eq!(session_id_from_headers(&HeaderMap::new()), None);
    }
}
