//! # DurableMCP Client
//!
//! Helpers for talking to a durable MCP server: the initial connect
//! handshake, and reconnect-with-resumption-token after a disconnect or a
//! server restart. The underlying HTTP client retries transient transport
//! failures, because a durable server is expected to outlive any single
//! connection to it.

pub mod sse;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use durablemcp_protocol::jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use durablemcp_protocol::types::methods;
use durablemcp_protocol::{
    LAST_EVENT_ID_HEADER, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER, PROTOCOL_VERSION,
};

use sse::SseParser;

/// Client error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP middleware failure (retries exhausted).
    #[error("http error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// (De)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server did not return a session id on connect.
    #[error("server returned no session id")]
    MissingSessionId,

    /// The server answered with a JSON-RPC error.
    #[error("server error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// The event stream ended before a final response arrived.
    #[error("stream ended without a response")]
    StreamEnded,
}

/// One event observed on a request's SSE stream.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    /// The resumption token, when the frame carried one.
    pub event_id: Option<String>,
    /// The decoded message.
    pub message: JsonRpcMessage,
}

/// Outcome of driving a request to completion.
#[derive(Debug)]
pub struct RequestOutcome {
    /// Result of the final response.
    pub result: Value,
    /// Every non-terminal event observed, in order.
    pub events: Vec<ServerEvent>,
    /// The last resumption token observed.
    pub last_event_id: Option<String>,
}

/// A connection to a durable MCP server.
#[derive(Debug)]
pub struct Connection {
    http: reqwest_middleware::ClientWithMiddleware,
    url: String,
    session_id: String,
    protocol_version: String,
    bearer_token: Option<String>,
    next_request_id: AtomicI64,
}

/// Options for [`connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client name sent in `initialize`.
    pub client_name: String,
    /// Client version sent in `initialize`.
    pub client_version: String,
    /// Bearer token attached to every request.
    pub bearer_token: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            bearer_token: None,
        }
    }
}

fn http_client() -> Result<reqwest_middleware::ClientWithMiddleware, ClientError> {
    // No overall timeout: requests may hold a long-lived SSE stream. A
    // durable server outlives individual connections, so transient
    // transport failures are retried with backoff.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;
    let retries = reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(5);
    Ok(reqwest_middleware::ClientBuilder::new(client)
        .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retries))
        .build())
}

/// Connect to a durable MCP server: `initialize`, capture the minted
/// session id, and acknowledge with `notifications/initialized`.
pub async fn connect(url: &str, options: ConnectOptions) -> Result<Connection, ClientError> {
    let connection = Connection {
        http: http_client()?,
        url: url.to_string(),
        session_id: String::new(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        bearer_token: options.bearer_token,
        next_request_id: AtomicI64::new(0),
    };

    let request = JsonRpcRequest::new(
        methods::INITIALIZE,
        Some(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": options.client_name,
                "version": options.client_version,
            },
        })),
        RequestId::Number(connection.next_request_id.fetch_add(1, Ordering::SeqCst)),
    );

    let response = connection.post_raw(&request, None).await?;
    let session_id = response
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .ok_or(ClientError::MissingSessionId)?;

    let mut connection = Connection {
        session_id,
        ..connection
    };
    let outcome = drive_to_completion(response).await?;
    if let Some(version) = outcome.result.get("protocolVersion").and_then(Value::as_str) {
        connection.protocol_version = version.to_string();
    }

    connection
        .notify(methods::INITIALIZED, Some(json!({})))
        .await?;

    Ok(connection)
}

/// Re-attach to an existing session after a disconnect. The caller
/// supplies the session id, negotiated protocol version, and the next
/// request id so ids keep increasing across the reconnect.
pub fn reconnect(
    url: &str,
    session_id: &str,
    protocol_version: &str,
    next_request_id: i64,
) -> Result<Connection, ClientError> {
    Ok(Connection {
        http: http_client()?,
        url: url.to_string(),
        session_id: session_id.to_string(),
        protocol_version: protocol_version.to_string(),
        bearer_token: None,
        next_request_id: AtomicI64::new(next_request_id),
    })
}

impl Connection {
    /// The server-minted session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// The next request id this connection will use.
    pub fn next_request_id(&self) -> i64 {
        self.next_request_id.load(Ordering::SeqCst)
    }

    /// Attach a bearer token to every subsequent request.
    pub fn set_bearer_token(&mut self, token: Option<String>) {
        self.bearer_token = token;
    }

    fn headers(&self, accept_sse: bool) -> Vec<(&'static str, String)> {
        let mut headers = vec![(
            "accept",
            if accept_sse {
                "application/json, text/event-stream".to_string()
            } else {
                "application/json".to_string()
            },
        )];
        if !self.session_id.is_empty() {
            headers.push((MCP_SESSION_ID_HEADER, self.session_id.clone()));
        }
        headers.push((MCP_PROTOCOL_VERSION_HEADER, self.protocol_version.clone()));
        if let Some(token) = &self.bearer_token {
            headers.push(("authorization", format!("Bearer {token}")));
        }
        headers
    }

    async fn post_raw(
        &self,
        request: &JsonRpcRequest,
        resumption_token: Option<&str>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .json(request);
        for (name, value) in self.headers(true) {
            builder = builder.header(name, value);
        }
        if let Some(token) = resumption_token {
            builder = builder.header(LAST_EVENT_ID_HEADER, token);
        }
        Ok(builder.send().await?.error_for_status()?)
    }

    /// Issue a request and drive its SSE stream to the final response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<RequestOutcome, ClientError> {
        let request = JsonRpcRequest::new(
            method,
            params,
            RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst)),
        );
        let response = self.post_raw(&request, None).await?;
        drive_to_completion(response).await
    }

    /// Resume an in-flight or completed request: the server replays the
    /// events after the resumption token rather than re-executing
    /// anything. Drives the replayed stream to the final response.
    pub async fn resume(&self, resumption_token: &str) -> Result<RequestOutcome, ClientError> {
        let mut builder = self
            .http
            .get(&self.url)
            .header(LAST_EVENT_ID_HEADER, resumption_token);
        for (name, value) in self.headers(true) {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?.error_for_status()?;
        drive_to_completion(response).await
    }

    /// Call a tool and wait for its result.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<RequestOutcome, ClientError> {
        self.request(
            methods::TOOLS_CALL,
            Some(json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let notification = JsonRpcNotification::new(method, params);
        let mut builder = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&notification);
        for (name, value) in self.headers(false) {
            builder = builder.header(name, value);
        }
        builder.send().await?.error_for_status()?;
        Ok(())
    }

    /// Answer a server-initiated request (e.g. an elicitation) by echoing
    /// the id the server sent it under.
    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), ClientError> {
        let response = JsonRpcResponse::new(result, id);
        let mut builder = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&response);
        for (name, value) in self.headers(false) {
            builder = builder.header(name, value);
        }
        builder.send().await?.error_for_status()?;
        Ok(())
    }

    /// Open the session's GET stream, optionally resuming after an event
    /// id. Returns the raw event receiver; the stream stays open until
    /// dropped.
    pub async fn open_event_stream(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<tokio::sync::mpsc::Receiver<ServerEvent>, ClientError> {
        let mut builder = self
            .http
            .get(&self.url)
            .header("accept", "text/event-stream")
            .header(MCP_SESSION_ID_HEADER, self.session_id.clone())
            .header(MCP_PROTOCOL_VERSION_HEADER, self.protocol_version.clone());
        if let Some(token) = &self.bearer_token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(last) = last_event_id {
            builder = builder.header(LAST_EVENT_ID_HEADER, last);
        }
        let response = builder.send().await?.error_for_status()?;

        let (sender, receiver) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let Ok(chunk) = chunk else { break };
                for frame in parser.push(&chunk) {
                    let Ok(message) = serde_json::from_str::<JsonRpcMessage>(&frame.data) else {
                        continue;
                    };
                    let event = ServerEvent {
                        event_id: frame.id,
                        message,
                    };
                    if sender.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(receiver)
    }
}

async fn drive_to_completion(response: reqwest::Response) -> Result<RequestOutcome, ClientError> {
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !content_type.contains("text/event-stream") {
        // Plain JSON response mode.
        let message: JsonRpcMessage = response.json().await?;
        return finish(message, Vec::new(), None);
    }

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();
    let mut events = Vec::new();
    let mut last_event_id = None;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for frame in parser.push(&chunk) {
            if let Some(id) = &frame.id {
                last_event_id = Some(id.clone());
            }
            if frame.data.is_empty() {
                continue;
            }
            let message: JsonRpcMessage = serde_json::from_str(&frame.data)?;
            if message.is_terminal() {
                return finish(message, events, last_event_id);
            }
            events.push(ServerEvent {
                event_id: frame.id,
                message,
            });
        }
    }

    Err(ClientError::StreamEnded)
}

fn finish(
    message: JsonRpcMessage,
    events: Vec<ServerEvent>,
    last_event_id: Option<String>,
) -> Result<RequestOutcome, ClientError> {
    match message {
        JsonRpcMessage::Response(response) => Ok(RequestOutcome {
            result: response.result,
            events,
            last_event_id,
        }),
        JsonRpcMessage::Error(error) => Err(ClientError::Rpc {
            code: error.error.code,
            message: error.error.message,
        }),
        other => {
            tracing::debug!(method = ?other.method(), "unexpected terminal message");
            Err(ClientError::StreamEnded)
        }
    }
}
