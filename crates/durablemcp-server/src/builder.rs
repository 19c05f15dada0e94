//! Registration surface and application assembly.
//!
//! [`DurableMcp`] collects tools, resources, and prompts, then
//! [`DurableMcp::application`] binds them to a state runtime and yields an
//! [`Application`] that owns the HTTP router and, when configured, the
//! auth middleware and a one-time initialize hook.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use futures::future::BoxFuture;
use schemars::{JsonSchema, SchemaGenerator};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use durablemcp_protocol::types::{
    Prompt, PromptMessage, Resource, ResourceTemplate, ServerInfo, Tool,
};
use durablemcp_runtime::StateRuntime;

use crate::adapter::DurableContext;
use crate::auth::{AuthConfig, AuthLayer, TokenVerifier};
use crate::error::ServerError;
use crate::http::McpService;
use crate::registry::{
    PromptRegistration, Registry, ResourceRegistration, TemplateRegistration, ToolRegistration,
};

type InitializeFn =
    Arc<dyn Fn(InitializeContext) -> BoxFuture<'static, Result<(), ServerError>> + Send + Sync>;

/// Builder for a durable MCP server.
pub struct DurableMcp {
    path: String,
    log_level: String,
    server_info: ServerInfo,
    auth: Option<(AuthConfig, Arc<dyn TokenVerifier>)>,
    effect_validation: bool,
    tools: Vec<ToolRegistration>,
    resources: Vec<ResourceRegistration>,
    templates: Vec<TemplateRegistration>,
    prompts: Vec<PromptRegistration>,
}

impl std::fmt::Debug for DurableMcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableMcp")
            .field("path", &self.path)
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl DurableMcp {
    /// Create a builder serving the MCP endpoint at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            log_level: "warn".to_string(),
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            auth: None,
            effect_validation: false,
            tools: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            prompts: Vec::new(),
        }
    }

    /// The endpoint path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Set the log-filter directive installed by [`Application::serve`].
    pub fn log_level(&mut self, level: impl Into<String>) -> &mut Self {
        self.log_level = level.into();
        self
    }

    /// Set the server name/version advertised on `initialize`.
    pub fn server_info(&mut self, name: impl Into<String>, version: impl Into<String>) -> &mut Self {
        self.server_info = ServerInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    /// Configure bearer authentication: settings and the token verifier
    /// always travel together.
    pub fn auth(&mut self, config: AuthConfig, verifier: Arc<dyn TokenVerifier>) -> &mut Self {
        self.auth = Some((config, verifier));
        self
    }

    /// Re-run every handler after success to detect side effects outside
    /// the executor combinators. Doubles CPU per invocation; off by
    /// default.
    pub fn effect_validation(&mut self, enabled: bool) -> &mut Self {
        self.effect_validation = enabled;
        self
    }

    /// Register a tool. The input schema is derived from `A`; the durable
    /// context never appears in it, so clients see the intended parameter
    /// set.
    pub fn tool<A, R, F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, DurableContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ServerError>> + Send + 'static,
    {
        let name = name.into();
        let input_schema = schema_for::<A>();
        let handler = Arc::new(handler);
        let erased = Arc::new(move |arguments: Value, context: DurableContext| {
            let handler = Arc::clone(&handler);
            let future: BoxFuture<'static, Result<Value, ServerError>> = Box::pin(async move {
                let arguments = if arguments.is_null() {
                    Value::Object(Default::default())
                } else {
                    arguments
                };
                let arguments: A = serde_json::from_value(arguments)
                    .map_err(|error| ServerError::invalid_params(error.to_string()))?;
                let result = handler(arguments, context).await?;
                Ok(serde_json::to_value(result)?)
            });
            future
        });

        self.tools.push(ToolRegistration {
            tool: Tool {
                name,
                title: None,
                description: Some(description.into()),
                input_schema,
                output_schema: None,
            },
            handler: erased,
        });
        self
    }

    /// Register a resource. A URI containing `{param}` segments registers
    /// a template; the handler receives the bound parameters.
    pub fn resource<F, Fut>(
        &mut self,
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        mime_type: Option<&str>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(std::collections::HashMap<String, String>, DurableContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<String, ServerError>> + Send + 'static,
    {
        let uri = uri.into();
        let handler = Arc::new(handler);
        let erased = Arc::new(
            move |params: std::collections::HashMap<String, String>, context: DurableContext| {
                let handler = Arc::clone(&handler);
                let future: BoxFuture<'static, Result<String, ServerError>> =
                    Box::pin(async move { handler(params, context).await });
                future
            },
        );

        if uri.contains('{') {
            self.templates.push(TemplateRegistration {
                template: ResourceTemplate {
                    uri_template: uri,
                    name: name.into(),
                    title: None,
                    description: Some(description.into()),
                    mime_type: mime_type.map(String::from),
                },
                handler: erased,
            });
        } else {
            self.resources.push(ResourceRegistration {
                resource: Resource {
                    uri,
                    name: name.into(),
                    title: None,
                    description: Some(description.into()),
                    mime_type: mime_type.map(String::from),
                },
                handler: erased,
            });
        }
        self
    }

    /// Register a prompt.
    pub fn prompt<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Value, DurableContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<PromptMessage>, ServerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = Arc::new(move |arguments: Value, context: DurableContext| {
            let handler = Arc::clone(&handler);
            let future: BoxFuture<'static, Result<Vec<PromptMessage>, ServerError>> =
                Box::pin(async move { handler(arguments, context).await });
            future
        });
        self.prompts.push(PromptRegistration {
            prompt: Prompt {
                name: name.into(),
                title: None,
                description: Some(description.into()),
            },
            handler: erased,
        });
        self
    }

    /// Bind the registrations to a state runtime.
    pub fn application(self, runtime: Arc<dyn StateRuntime>) -> Application {
        let registry = Arc::new(Registry {
            server_info: self.server_info,
            tools: self.tools,
            resources: self.resources,
            templates: self.templates,
            prompts: self.prompts,
        });
        Application {
            path: self.path,
            log_level: self.log_level,
            auth: self.auth,
            effect_validation: self.effect_validation,
            registry,
            runtime,
            initialize: None,
        }
    }
}

/// Context of the one-time initialize hook: durable writes here should be
/// keyed so a restarted deployment does not repeat them.
#[derive(Clone)]
pub struct InitializeContext {
    runtime: Arc<dyn StateRuntime>,
}

impl std::fmt::Debug for InitializeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializeContext").finish()
    }
}

impl InitializeContext {
    /// The state runtime.
    pub fn runtime(&self) -> &Arc<dyn StateRuntime> {
        &self.runtime
    }

    /// An idempotency key scoped to application initialization.
    pub fn idempotently(&self, key: &str) -> String {
        format!("init:{key}")
    }
}

/// A runnable durable MCP application.
pub struct Application {
    path: String,
    log_level: String,
    auth: Option<(AuthConfig, Arc<dyn TokenVerifier>)>,
    effect_validation: bool,
    registry: Arc<Registry>,
    runtime: Arc<dyn StateRuntime>,
    initialize: Option<InitializeFn>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("path", &self.path)
            .finish()
    }
}

impl Application {
    /// Install a callback run once after the application's servicers
    /// start, for seeding well-known durable structures.
    pub fn initialize<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(InitializeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        self.initialize = Some(Arc::new(move |context| Box::pin(callback(context))));
        self
    }

    /// The state runtime this application commits through.
    pub fn runtime(&self) -> &Arc<dyn StateRuntime> {
        &self.runtime
    }

    /// Run the initialize hook and build the router. Suitable for tests
    /// and embedding into a larger axum application.
    pub async fn into_router(self) -> Result<Router, ServerError> {
        if let Some(initialize) = &self.initialize {
            initialize(InitializeContext {
                runtime: Arc::clone(&self.runtime),
            })
            .await?;
        }

        let service = McpService::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.registry),
            self.effect_validation,
        );
        let router = service.router(&self.path);

        Ok(match self.auth {
            Some((config, verifier)) => router.layer(AuthLayer::new(config, verifier)),
            None => router,
        })
    }

    /// Serve the application on `addr` until the process exits.
    pub async fn serve(self, addr: &str) -> Result<(), ServerError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.clone()));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

        let path = self.path.clone();
        let router = self.into_router().await?;

        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|error| ServerError::Transport {
                    message: format!("bind {addr}: {error}"),
                })?;
        tracing::info!(%addr, %path, "durable MCP endpoint ready");

        axum::serve(listener, router)
            .await
            .map_err(|error| ServerError::Transport {
                message: error.to_string(),
            })
    }
}

fn schema_for<T: JsonSchema>() -> Value {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| Value::Object(Default::default()))
}
