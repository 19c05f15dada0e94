//! The MCP message subset the durable runtime speaks.
//!
//! Only the types the runtime itself inspects are modeled; tool results and
//! arguments pass through as raw [`serde_json::Value`]s. Field names follow
//! the MCP wire form (camelCase).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::RequestId;

/// Method names the runtime dispatches on.
pub mod methods {
    /// Client -> server: session handshake.
    pub const INITIALIZE: &str = "initialize";
    /// Client -> server: handshake acknowledgement (ignored, handlers run
    /// stateless).
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Tool listing and invocation.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Resource listing.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource template listing.
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// Resource read.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Prompt listing.
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Prompt expansion.
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Server -> client: interactive input request.
    pub const ELICITATION_CREATE: &str = "elicitation/create";
    /// Server -> client: progress update.
    pub const PROGRESS: &str = "notifications/progress";
    /// Server -> client: log message.
    pub const LOGGING_MESSAGE: &str = "notifications/message";
    /// Either direction: a request was cancelled.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Server -> client: tool list changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Server -> client: resource list changed.
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    /// Server -> client: prompt list changed.
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

/// Name/title/version triple identifying one side of the connection.
///
/// `name` is technically required by MCP but not all clients validate it,
/// so it is optional here; `version` always arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name, e.g. "Visual Studio Code".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Client version.
    pub version: String,
}

impl ClientInfo {
    /// Whether this client is Visual Studio Code, which consumes all events
    /// through a single GET stream.
    pub fn is_vscode(&self) -> bool {
        self.name.as_deref() == Some("Visual Studio Code")
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Requested protocol version.
    pub protocol_version: String,
    /// Client capabilities (opaque to the runtime).
    #[serde(default)]
    pub capabilities: Value,
    /// Client identification.
    pub client_info: ClientInfo,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
    /// Server identification.
    pub server_info: ServerInfo,
}

/// Server identification in the `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

/// Capabilities advertised in the `initialize` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Tools capability, present when any tool is registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    /// Resources capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ListChangedCapability>,
    /// Prompts capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    /// Logging capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

/// Capability with a `listChanged` flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    /// Whether list-changed notifications are emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// The `_meta` object carried on request and notification params.
///
/// `rebootEventId` is how deterministic server-initiated events carry their
/// replay identity across the wire; `progressToken` is how clients opt into
/// progress notifications for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Deterministic event id for replayable server-initiated messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot_event_id: Option<String>,
    /// Progress token supplied by the client on the originating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<RequestId>,
}

/// Extract `params._meta.rebootEventId` from a raw params value.
pub fn reboot_event_id(params: Option<&Value>) -> Option<String> {
    params?
        .get("_meta")?
        .get("rebootEventId")?
        .as_str()
        .map(String::from)
}

/// Extract `params._meta.progressToken` from a raw params value.
pub fn progress_token(params: Option<&Value>) -> Option<RequestId> {
    serde_json::from_value(params?.get("_meta")?.get("progressToken")?.clone()).ok()
}

/// Tool descriptor returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tool description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool arguments.
    pub input_schema: Value,
    /// JSON schema of the structured output, when declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// `tools/call` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Name of the tool to invoke.
    pub name: String,
    /// Tool arguments.
    #[serde(default)]
    pub arguments: Value,
    /// Request metadata.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// A single content block in a tool/prompt result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Content {
    /// Plain text content.
    Text {
        /// The text.
        text: String,
    },
}

impl Content {
    /// Text content block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Content blocks.
    pub content: Vec<Content>,
    /// Structured result mirroring the content, when the tool declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Whether this result represents a tool-level error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    /// Successful result carrying a structured value.
    pub fn structured(value: Value) -> Self {
        Self {
            content: vec![Content::text(value.to_string())],
            structured_content: Some(value),
            is_error: None,
        }
    }

    /// Tool-level error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            structured_content: None,
            is_error: Some(true),
        }
    }
}

/// Resource descriptor returned by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource URI.
    pub uri: String,
    /// Resource name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Resource template descriptor returned by `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// URI template, e.g. `resource://{city}/weather`.
    pub uri_template: String,
    /// Template name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One entry of a `resources/read` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource URI.
    pub uri: String,
    /// MIME type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text content.
    pub text: String,
}

/// Prompt descriptor returned by `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Prompt name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One message of an expanded prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Role, `user` or `assistant`.
    pub role: String,
    /// Message content.
    pub content: Content,
}

/// `prompts/get` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Prompt description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Expanded messages.
    pub messages: Vec<PromptMessage>,
}

/// `notifications/progress` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Token from the originating request's `_meta.progressToken`.
    pub progress_token: RequestId,
    /// Current progress value.
    pub progress: f64,
    /// Total, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Progress message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Notification metadata carrying the deterministic event id.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Logging level of a `notifications/message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    /// Debug-level message.
    Debug,
    /// Info-level message.
    Info,
    /// Warning-level message.
    Warning,
    /// Error-level message.
    Error,
}

impl LoggingLevel {
    /// The wire form of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// `notifications/message` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMessageParams {
    /// Severity.
    pub level: LoggingLevel,
    /// Log payload.
    pub data: Value,
    /// Logger name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// Notification metadata carrying the deterministic event id.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// `elicitation/create` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitParams {
    /// Message shown to the user.
    pub message: String,
    /// Primitive-only JSON schema of the expected answer.
    pub requested_schema: Value,
    /// Request metadata; elicitation resend ids are random per send.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Outcome of an elicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitAction {
    /// User accepted and supplied data.
    Accept,
    /// User declined.
    Decline,
    /// User cancelled.
    Cancel,
}

/// `elicitation/create` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitResult {
    /// What the user did.
    pub action: ElicitAction,
    /// The supplied data, for `accept`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// `notifications/cancelled` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// Id of the cancelled request.
    pub request_id: RequestId,
    /// Cancellation reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Notification metadata carrying the deterministic event id.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vscode_detection() {
        let vscode = ClientInfo {
            name: Some("Visual Studio Code".into()),
            title: None,
            version: "1.96.0".into(),
        };
        assert!(vscode.is_vscode());

        let nameless = ClientInfo {
            name: None,
            title: None,
            version: "0.1.0".into(),
        };
        assert!(!nameless.is_vscode());
    }

    #[test]
    fn meta_extraction() {
        let params = json!({
            "progressToken": 3,
            "_meta": {"rebootEventId": "abc123", "progressToken": "tok"}
        });
        assert_eq!(reboot_event_id(Some(&params)).as_deref(), Some("abc123"));
        assert_eq!(
            progress_token(Some(&params)),
            Some(RequestId::String("tok".into()))
        );
        assert_eq!(reboot_event_id(None), None);
    }

    #[test]
    fn elicit_result_wire_form() {
        let result: ElicitResult =
            serde_json::from_value(json!({"action": "accept", "content": {"confirmed": true}}))
                .unwrap();
        assert_eq!(result.action, ElicitAction::Accept);
        assert_eq!(result.content, Some(json!({"confirmed": true})));

        let declined: ElicitResult = serde_json::from_value(json!({"action": "decline"})).unwrap();
        assert_eq!(declined.action, ElicitAction::Decline);
        assert!(declined.content.is_none());
    }

    #[test]
    fn progress_params_round_trip() {
        let params = ProgressParams {
            progress_token: RequestId::Number(1),
            progress: 0.5,
            total: Some(1.0),
            message: None,
            meta: Some(Meta {
                reboot_event_id: Some("deadbeef".into()),
                progress_token: None,
            }),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["progressToken"], json!(1));
        assert_eq!(value["_meta"]["rebootEventId"], json!("deadbeef"));
        let back: ProgressParams = serde_json::from_value(value).unwrap();
        assert_eq!(back.progress, 0.5);
    }
}
