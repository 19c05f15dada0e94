//! Registered tools, resources, and prompts.
//!
//! Handlers are stored type-erased; the typed registration surface lives
//! on [`crate::builder::DurableMcp`], which derives input schemas from the
//! argument types and erases the handler into the boxed forms here. The
//! durable-context parameter never appears in a derived schema, so clients
//! see exactly the intended parameter set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use durablemcp_protocol::types::{
    ListChangedCapability, Prompt, PromptMessage, Resource, ResourceTemplate, ServerCapabilities,
    ServerInfo, Tool,
};

use crate::adapter::DurableContext;
use crate::error::ServerError;

/// Type-erased tool handler.
pub type ToolHandlerFn =
    Arc<dyn Fn(Value, DurableContext) -> BoxFuture<'static, Result<Value, ServerError>> + Send + Sync>;

/// Type-erased resource handler: URI template parameters in, text out.
pub type ResourceHandlerFn = Arc<
    dyn Fn(HashMap<String, String>, DurableContext) -> BoxFuture<'static, Result<String, ServerError>>
        + Send
        + Sync,
>;

/// Type-erased prompt handler: arguments in, messages out.
pub type PromptHandlerFn = Arc<
    dyn Fn(Value, DurableContext) -> BoxFuture<'static, Result<Vec<PromptMessage>, ServerError>>
        + Send
        + Sync,
>;

/// A registered tool.
#[derive(Clone)]
pub struct ToolRegistration {
    /// Wire descriptor.
    pub tool: Tool,
    /// The handler.
    pub handler: ToolHandlerFn,
}

/// A registered fixed-URI resource.
#[derive(Clone)]
pub struct ResourceRegistration {
    /// Wire descriptor.
    pub resource: Resource,
    /// The handler.
    pub handler: ResourceHandlerFn,
}

/// A registered resource template.
#[derive(Clone)]
pub struct TemplateRegistration {
    /// Wire descriptor.
    pub template: ResourceTemplate,
    /// The handler.
    pub handler: ResourceHandlerFn,
}

/// A registered prompt.
#[derive(Clone)]
pub struct PromptRegistration {
    /// Wire descriptor.
    pub prompt: Prompt,
    /// The handler.
    pub handler: PromptHandlerFn,
}

/// Everything registered against one server path.
#[derive(Clone)]
pub struct Registry {
    /// Server identification for `initialize`.
    pub server_info: ServerInfo,
    /// Registered tools, in registration order.
    pub tools: Vec<ToolRegistration>,
    /// Registered fixed-URI resources.
    pub resources: Vec<ResourceRegistration>,
    /// Registered resource templates.
    pub templates: Vec<TemplateRegistration>,
    /// Registered prompts.
    pub prompts: Vec<PromptRegistration>,
}

impl Registry {
    /// The capabilities this registry advertises.
    pub fn capabilities(&self) -> ServerCapabilities {
        let list_changed = |present: bool| {
            present.then_some(ListChangedCapability {
                list_changed: Some(true),
            })
        };
        ServerCapabilities {
            tools: list_changed(!self.tools.is_empty()),
            resources: list_changed(!self.resources.is_empty() || !self.templates.is_empty()),
            prompts: list_changed(!self.prompts.is_empty()),
            logging: Some(Value::Object(Default::default())),
        }
    }

    /// Find a tool by name.
    pub fn tool(&self, name: &str) -> Option<&ToolRegistration> {
        self.tools.iter().find(|t| t.tool.name == name)
    }

    /// Find a prompt by name.
    pub fn prompt(&self, name: &str) -> Option<&PromptRegistration> {
        self.prompts.iter().find(|p| p.prompt.name == name)
    }

    /// Resolve a `resources/read` URI: fixed resources first, then
    /// templates in registration order.
    pub fn resolve_resource(
        &self,
        uri: &str,
    ) -> Option<(ResourceHandlerFn, HashMap<String, String>, Option<String>)> {
        if let Some(fixed) = self.resources.iter().find(|r| r.resource.uri == uri) {
            return Some((
                Arc::clone(&fixed.handler),
                HashMap::new(),
                fixed.resource.mime_type.clone(),
            ));
        }
        for registration in &self.templates {
            // `Some(empty map)` is a valid match for templates with no
            // parameters; only `None` means no match.
            if let Some(params) = match_template(&registration.template.uri_template, uri) {
                return Some((
                    Arc::clone(&registration.handler),
                    params,
                    registration.template.mime_type.clone(),
                ));
            }
        }
        None
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.tools.len())
            .field("resources", &self.resources.len())
            .field("templates", &self.templates.len())
            .field("prompts", &self.prompts.len())
            .finish()
    }
}

/// Match a URI against a `{param}` template, segment-wise on `/`.
///
/// Returns the bound parameters on a match; an empty map is a successful
/// match of a parameter-less template.
pub fn match_template(template: &str, uri: &str) -> Option<HashMap<String, String>> {
    let template_segments: Vec<&str> = template.split('/').collect();
    let uri_segments: Vec<&str> = uri.split('/').collect();
    if template_segments.len() != uri_segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (pattern, actual) in template_segments.iter().zip(&uri_segments) {
        if let Some(name) = pattern.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            if actual.is_empty() {
                return None;
            }
            params.insert(name.to_string(), (*actual).to_string());
        } else if pattern != actual {
            return None;
        }
    }
    Some(params)
}
