//! The durable handler context.
//!
//! Handlers receive exactly one [`DurableContext`]. Every capability on it
//! that reaches the client (progress, log messages, list-changed
//! notifications, elicitation) emits an event whose id is deterministic
//! (UUIDv5 over the workflow id and an alias encoding the call site), so a
//! re-executed handler produces the *same* events and replay dedupes them.
//! Calling a capability twice with the same arguments in one invocation is
//! a developer error and fails loudly.

use std::sync::Arc;

use schemars::{JsonSchema, SchemaGenerator};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use durablemcp_protocol::event_id::deterministic_event_id;
use durablemcp_protocol::jsonrpc::RequestId;
use durablemcp_protocol::normalize::normalize_numbers;
use durablemcp_protocol::types::{
    ElicitAction, ElicitParams, ElicitResult, LoggingLevel, LoggingMessageParams, Meta,
    ProgressParams, methods,
};
use durablemcp_runtime::{Memoize, StateRuntime, WorkflowContext, at_least_once};

use crate::auth::AccessToken;
use crate::engine::ServerSession;
use crate::error::ServerError;
use crate::registry::ToolRegistration;

/// Outcome of an elicitation, parsed against the requested schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ElicitationResult<T> {
    /// The user accepted and the content validated.
    Accepted {
        /// The validated data.
        data: T,
    },
    /// The user declined.
    Declined,
    /// The user cancelled.
    Cancelled,
}

/// The one context argument a durable handler receives.
#[derive(Debug, Clone)]
pub struct DurableContext {
    workflow: WorkflowContext,
    engine_session: ServerSession,
    access_token: Option<AccessToken>,
    progress_token: Option<RequestId>,
}

impl DurableContext {
    pub(crate) fn new(
        workflow: WorkflowContext,
        engine_session: ServerSession,
        access_token: Option<AccessToken>,
        progress_token: Option<RequestId>,
    ) -> Self {
        Self {
            workflow,
            engine_session,
            access_token,
            progress_token,
        }
    }

    /// The workflow context, for `at_least_once` / `at_most_once` steps.
    pub fn workflow(&self) -> &WorkflowContext {
        &self.workflow
    }

    /// The state runtime, for durable user storage like
    /// [`crate::sorted_map::SortedMap`].
    pub fn runtime(&self) -> &Arc<dyn StateRuntime> {
        self.workflow.runtime()
    }

    /// The verified access token of the originating request, when auth is
    /// configured. Per-tool authorization reads scopes from here.
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    /// Session-level capabilities (list-changed notifications).
    pub fn session(&self) -> DurableSession {
        DurableSession {
            context: self.clone(),
        }
    }

    pub(crate) fn set_tolerate_closed(&self, tolerate: bool) {
        self.engine_session.set_tolerate_closed(tolerate);
    }

    fn deterministic_id(&self, alias: &str) -> Result<String, ServerError> {
        let alias = self.workflow.register_event_alias(alias)?;
        Ok(deterministic_event_id(&self.workflow.workflow_id(), &alias))
    }

    /// Report progress for the current operation.
    ///
    /// A no-op when the client did not supply a progress token. Calling
    /// twice with identical arguments in one invocation is an error;
    /// progress going backwards is the developer's responsibility.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> Result<(), ServerError> {
        let Some(progress_token) = self.progress_token.clone() else {
            return Ok(());
        };

        let alias = format!(
            "report_progress(progress={}, total={}, message={})",
            fmt_float(progress),
            fmt_opt_float(total),
            fmt_opt_str(message),
        );
        let event_id = self.deterministic_id(&alias)?;

        let params = ProgressParams {
            progress_token,
            progress,
            total,
            message: message.map(String::from),
            meta: Some(Meta {
                reboot_event_id: Some(event_id),
                progress_token: None,
            }),
        };
        self.engine_session
            .send_notification(methods::PROGRESS, serde_json::to_value(params)?)
            .await
    }

    /// Send a log message to the client.
    pub async fn log(
        &self,
        level: LoggingLevel,
        message: &str,
        logger_name: Option<&str>,
    ) -> Result<(), ServerError> {
        let alias = format!(
            "log(level='{}', message='{}', logger_name={})",
            level.as_str(),
            message,
            fmt_opt_str(logger_name),
        );
        let event_id = self.deterministic_id(&alias)?;

        let params = LoggingMessageParams {
            level,
            data: json!(message),
            logger: logger_name.map(String::from),
            meta: Some(Meta {
                reboot_event_id: Some(event_id),
                progress_token: None,
            }),
        };
        self.engine_session
            .send_notification(methods::LOGGING_MESSAGE, serde_json::to_value(params)?)
            .await
    }

    /// Send a debug-level log message.
    pub async fn debug(&self, message: &str) -> Result<(), ServerError> {
        self.log(LoggingLevel::Debug, message, None).await
    }

    /// Send an info-level log message.
    pub async fn info(&self, message: &str) -> Result<(), ServerError> {
        self.log(LoggingLevel::Info, message, None).await
    }

    /// Send a warning-level log message.
    pub async fn warning(&self, message: &str) -> Result<(), ServerError> {
        self.log(LoggingLevel::Warning, message, None).await
    }

    /// Send an error-level log message.
    pub async fn error(&self, message: &str) -> Result<(), ServerError> {
        self.log(LoggingLevel::Error, message, None).await
    }

    /// Elicit structured input from the client's user.
    ///
    /// The elicitation is *issued* at most once per call site: a durable
    /// memoize cell remembers that it went out, but *sent over the wire*
    /// on every retry, with a fresh random id each time, because the
    /// client is not durable. When a crashed handler re-enters, the
    /// message is prefixed so the user understands why they are being
    /// asked again. The schema derived from `T` may only use primitive
    /// types.
    pub async fn elicit<T>(&self, message: &str) -> Result<ElicitationResult<T>, ServerError>
    where
        T: JsonSchema + DeserializeOwned,
    {
        let schema = SchemaGenerator::default().into_root_schema_for::<T>();
        let schema = serde_json::to_value(&schema)?;
        validate_elicitation_schema(&schema)?;

        let alias = format!(
            "elicit(message='{message}', schema={})",
            short_type_name::<T>()
        );
        let alias = self.workflow.register_event_alias(&alias)?;
        let memoize_id = deterministic_event_id(&self.workflow.workflow_id(), &alias);

        let memoize = Memoize::reference(&memoize_id);
        memoize.reset_per_workflow(&self.workflow, &alias).await?;

        let message = if memoize.started(self.runtime()).await? {
            format!("Sorry, we got disconnected and need to try again: {message}")
        } else {
            memoize.start(self.runtime()).await?;
            message.to_string()
        };

        let session = self.engine_session.clone();
        let send_request_and_wait_for_result = || async move {
            // A fresh random id every send: the client is not durable, so
            // the request must actually go out on each retry.
            let resend_id = Uuid::new_v4().simple().to_string();
            let params = ElicitParams {
                message,
                requested_schema: schema,
                meta: Some(Meta {
                    reboot_event_id: Some(resend_id),
                    progress_token: None,
                }),
            };
            let params =
                serde_json::to_value(params).map_err(durablemcp_runtime::RuntimeError::from)?;
            session
                .send_request(methods::ELICITATION_CREATE, params)
                .await
                .map_err(ServerError::into_runtime)
        };

        let result: Value = at_least_once(
            &format!("Send request, wait for result: {memoize_id}"),
            &self.workflow,
            send_request_and_wait_for_result,
        )
        .await?;

        let mut result = result;
        normalize_numbers(&mut result);
        let result: ElicitResult = serde_json::from_value(result)?;

        match (result.action, result.content) {
            (ElicitAction::Accept, Some(mut content)) => {
                normalize_numbers(&mut content);
                Ok(ElicitationResult::Accepted {
                    data: serde_json::from_value(content)?,
                })
            }
            (ElicitAction::Accept, None) => Err(ServerError::handler(
                "elicitation accepted without content",
            )),
            (ElicitAction::Decline, _) => Ok(ElicitationResult::Declined),
            (ElicitAction::Cancel, _) => Ok(ElicitationResult::Cancelled),
        }
    }
}

/// Session-level capabilities of the durable context.
#[derive(Debug, Clone)]
pub struct DurableSession {
    context: DurableContext,
}

impl DurableSession {
    async fn send_list_changed(&self, function: &str, method: &str, why: &str) -> Result<(), ServerError> {
        let event_id = self.context.deterministic_id(&format!("{function}: {why}"))?;
        self.context
            .engine_session
            .send_notification(method, json!({"_meta": {"rebootEventId": event_id}}))
            .await
    }

    /// Notify the client that the resource list changed. `why` durably
    /// differentiates repeated notifications.
    pub async fn send_resource_list_changed(&self, why: &str) -> Result<(), ServerError> {
        self.send_list_changed(
            "send_resource_list_changed",
            methods::RESOURCES_LIST_CHANGED,
            why,
        )
        .await
    }

    /// Notify the client that the tool list changed.
    pub async fn send_tool_list_changed(&self, why: &str) -> Result<(), ServerError> {
        self.send_list_changed("send_tool_list_changed", methods::TOOLS_LIST_CHANGED, why)
            .await
    }

    /// Notify the client that the prompt list changed.
    pub async fn send_prompt_list_changed(&self, why: &str) -> Result<(), ServerError> {
        self.send_list_changed(
            "send_prompt_list_changed",
            methods::PROMPTS_LIST_CHANGED,
            why,
        )
        .await
    }
}

/// Invoke a tool handler, optionally re-running it to validate that all
/// side effects go through the executor combinators.
pub(crate) async fn call_tool(
    registration: &ToolRegistration,
    arguments: Value,
    context: DurableContext,
    effect_validation: bool,
) -> Result<Value, ServerError> {
    let checkpoint = context.workflow().checkpoint();

    let result = invoke(registration, arguments.clone(), context.clone()).await?;

    if !effect_validation {
        return Ok(result);
    }

    tracing::info!(
        tool = %registration.tool.name,
        "re-running tool to validate effects"
    );

    // Rewind the executor so the re-run behaves like a retry from
    // scratch. Completed steps replay their recorded values, so a
    // deterministic handler produces no new side effects.
    context.workflow().restore(&checkpoint);
    context.set_tolerate_closed(true);
    let result = invoke(registration, arguments, context.clone()).await;
    context.set_tolerate_closed(false);
    result
}

async fn invoke(
    registration: &ToolRegistration,
    arguments: Value,
    context: DurableContext,
) -> Result<Value, ServerError> {
    match (registration.handler)(arguments, context).await {
        Err(error @ ServerError::PermissionDenied { .. }) => {
            // Authorization failures log at info, without a backtrace.
            tracing::info!(
                tool = %registration.tool.name,
                "authorization denied in tool: {error}"
            );
            Err(error)
        }
        other => other,
    }
}

fn validate_elicitation_schema(schema: &Value) -> Result<(), ServerError> {
    let properties = match schema.get("properties") {
        Some(Value::Object(properties)) => properties,
        _ => return Ok(()),
    };
    for (name, property) in properties {
        if !is_primitive_property(property) {
            return Err(ServerError::InvalidElicitationSchema {
                message: format!("property '{name}' is not a primitive type"),
            });
        }
    }
    Ok(())
}

fn is_primitive_property(property: &Value) -> bool {
    const PRIMITIVES: [&str; 5] = ["string", "number", "integer", "boolean", "null"];
    match property.get("type") {
        Some(Value::String(ty)) => PRIMITIVES.contains(&ty.as_str()),
        // Optional fields come out as ["<type>", "null"].
        Some(Value::Array(types)) => types
            .iter()
            .all(|ty| ty.as_str().is_some_and(|ty| PRIMITIVES.contains(&ty))),
        _ => false,
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

fn fmt_float(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn fmt_opt_float(value: Option<f64>) -> String {
    value.map(fmt_float).unwrap_or_else(|| "None".to_string())
}

fn fmt_opt_str(value: Option<&str>) -> String {
    value.map(String::from).unwrap_or_else(|| "None".to_string())
}
