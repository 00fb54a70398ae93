//! Server configuration and startup.
//!
//! An [`McpServer`] is configured single-threaded (tools, resources,
//! observers, options), then frozen by [`McpServer::finalize`] into an
//! `Arc` shared by transports, dispatcher tasks and notifiers. The routing
//! tree and registration maps are read-only from that point on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::change::{
    ResourceChangeHandle, ResourceListChangeHandle, ResourceListChangePipeline,
};
use crate::context::{
    default_resource_list_handler, is_template_uri, ResourceHandler, ResourceListHandler,
    ToolHandler,
};
use crate::error::{Error, Result};
use crate::protocol::capabilities::{ResourcesCapability, ServerCapabilities, ToolsCapability};
use crate::protocol::types::{
    ResourceDescriptor, ResourceTemplate, ToolAnnotations, ToolDescriptor,
};
use crate::routing::RouteTree;
use crate::session::{SessionManager, SessionStore};
use crate::subscription::{
    ListChangeSubscriptionManager, ListChangeSubscriptionStore, ResourceSubscriptionManager,
    ResourceSubscriptionStore,
};
use crate::transport::{StdioTransport, StreamableHttpTransport};

/// Default liveness window for subscriptions.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Middleware wrapping a tool handler.
pub type ToolMiddleware = Arc<dyn Fn(Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> + Send + Sync>;

/// Middleware wrapping a resource handler.
pub type ResourceMiddleware =
    Arc<dyn Fn(Arc<dyn ResourceHandler>) -> Arc<dyn ResourceHandler> + Send + Sync>;

pub(crate) struct RegisteredTool {
    pub(crate) descriptor: ToolDescriptor,
    pub(crate) handler: Arc<dyn ToolHandler>,
}

/// Registration options for a tool.
#[derive(Default)]
pub struct ToolOptions {
    description: Option<String>,
    annotations: Option<ToolAnnotations>,
    middleware: Vec<ToolMiddleware>,
}

impl ToolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Add middleware; the first added runs outermost.
    pub fn middleware(mut self, middleware: ToolMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }
}

/// Registration options for a resource.
#[derive(Default)]
pub struct ResourceOptions {
    description: Option<String>,
    mime_type: Option<String>,
    middleware: Vec<ResourceMiddleware>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn middleware(mut self, middleware: ResourceMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }
}

/// The framework instance: registration surface, protocol engine state and
/// startup entry points.
pub struct McpServer {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) instructions: Option<String>,
    pub(crate) tools: HashMap<String, RegisteredTool>,
    tool_middleware: Vec<ToolMiddleware>,
    resource_middleware: Vec<ResourceMiddleware>,
    pub(crate) resources: Arc<HashMap<String, ResourceDescriptor>>,
    pub(crate) templates: HashMap<String, ResourceTemplate>,
    pub(crate) routes: RouteTree,
    pub(crate) list_handler: Arc<dyn ResourceListHandler>,
    pub(crate) capabilities: ServerCapabilities,
    pub(crate) sessions: SessionManager,
    pub(crate) resource_subscriptions: ResourceSubscriptionManager,
    pub(crate) list_subscriptions: ListChangeSubscriptionManager,
    pub(crate) list_pipeline: Arc<ResourceListChangePipeline>,
    observers: Mutex<Vec<BoxFuture<'static, ()>>>,
    root: CancellationToken,
    started: bool,
}

impl McpServer {
    pub fn new(name: impl Into<String>) -> Self {
        let root = CancellationToken::new();
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            instructions: None,
            tools: HashMap::new(),
            tool_middleware: Vec::new(),
            resource_middleware: Vec::new(),
            resources: Arc::new(HashMap::new()),
            templates: HashMap::new(),
            routes: RouteTree::default(),
            list_handler: Arc::new(default_resource_list_handler),
            capabilities: ServerCapabilities::default(),
            sessions: SessionManager::in_memory(root.clone()),
            resource_subscriptions: ResourceSubscriptionManager::in_memory(
                DEFAULT_HEALTH_INTERVAL,
            ),
            list_subscriptions: ListChangeSubscriptionManager::in_memory(DEFAULT_HEALTH_INTERVAL),
            list_pipeline: Arc::new(ResourceListChangePipeline::new()),
            observers: Mutex::new(Vec::new()),
            root,
            started: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Usage hints surfaced to clients in the initialize result.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = SessionManager::new(store);
        self
    }

    pub fn with_resource_subscription_store(
        mut self,
        store: Arc<dyn ResourceSubscriptionStore>,
    ) -> Self {
        let interval = self.resource_subscriptions.health_interval();
        self.resource_subscriptions = ResourceSubscriptionManager::new(store, interval);
        self
    }

    pub fn with_list_change_subscription_store(
        mut self,
        store: Arc<dyn ListChangeSubscriptionStore>,
    ) -> Self {
        let interval = self.list_subscriptions.health_interval();
        self.list_subscriptions = ListChangeSubscriptionManager::new(store, interval);
        self
    }

    /// Liveness window for resource subscriptions. Replaces the default
    /// in-memory store, so set this before a custom store.
    pub fn with_resource_subscription_health_interval(mut self, interval: Duration) -> Self {
        self.resource_subscriptions = ResourceSubscriptionManager::in_memory(interval);
        self
    }

    /// Liveness window for the resource-list subscription. Replaces the
    /// default in-memory store, so set this before a custom store.
    pub fn with_list_change_health_interval(mut self, interval: Duration) -> Self {
        self.list_subscriptions = ListChangeSubscriptionManager::in_memory(interval);
        self
    }

    fn ensure_configurable(&self) -> Result<()> {
        if self.started {
            return Err(Error::LockingConflict);
        }
        Ok(())
    }

    /// Register a tool. `input_schema` is a prebuilt JSON Schema object
    /// describing the arguments.
    pub fn tool(
        &mut self,
        name: &str,
        input_schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Result<()> {
        self.tool_with(name, input_schema, handler, ToolOptions::default())
    }

    pub fn tool_with(
        &mut self,
        name: &str,
        input_schema: Value,
        handler: impl ToolHandler + 'static,
        options: ToolOptions,
    ) -> Result<()> {
        self.ensure_configurable()?;
        if self.capabilities.tools.is_none() {
            self.capabilities.tools = Some(ToolsCapability::default());
        }

        let mut handler: Arc<dyn ToolHandler> = Arc::new(handler);
        for middleware in options.middleware.iter().rev() {
            handler = middleware(handler);
        }

        self.tools.insert(
            name.to_string(),
            RegisteredTool {
                descriptor: ToolDescriptor {
                    name: name.to_string(),
                    description: options.description,
                    input_schema,
                    annotations: options.annotations,
                },
                handler,
            },
        );
        Ok(())
    }

    /// Register a resource. A URI whose path contains a `{param}` segment is
    /// additionally recorded as a template.
    pub fn resource(
        &mut self,
        name: &str,
        uri: &str,
        handler: impl ResourceHandler + 'static,
    ) -> Result<()> {
        self.resource_with(name, uri, handler, ResourceOptions::default())
    }

    pub fn resource_with(
        &mut self,
        name: &str,
        uri: &str,
        handler: impl ResourceHandler + 'static,
        options: ResourceOptions,
    ) -> Result<()> {
        self.ensure_configurable()?;
        if self.capabilities.resources.is_none() {
            self.capabilities.resources = Some(ResourcesCapability::default());
        }

        let parsed = Url::parse(uri)?;
        let mut handler: Arc<dyn ResourceHandler> = Arc::new(handler);
        for middleware in options.middleware.iter().rev() {
            handler = middleware(handler);
        }

        if is_template_uri(uri) {
            self.templates.insert(
                uri.to_string(),
                ResourceTemplate {
                    uri_template: uri.to_string(),
                    name: name.to_string(),
                    description: options.description.clone(),
                    mime_type: options.mime_type.clone(),
                },
            );
        }

        self.routes
            .insert(&parsed, Some(handler), options.mime_type.clone());
        Arc::make_mut(&mut self.resources).insert(
            uri.to_string(),
            ResourceDescriptor {
                uri: uri.to_string(),
                name: name.to_string(),
                description: options.description,
                mime_type: options.mime_type,
            },
        );
        Ok(())
    }

    /// Replace the `resources/list` handler.
    pub fn resource_list(&mut self, handler: impl ResourceListHandler + 'static) -> Result<()> {
        self.ensure_configurable()?;
        self.list_handler = Arc::new(handler);
        Ok(())
    }

    /// Add middleware to every tool handler; the first added runs outermost.
    pub fn use_in_tools(&mut self, middleware: ToolMiddleware) -> Result<()> {
        self.ensure_configurable()?;
        self.tool_middleware.push(middleware);
        Ok(())
    }

    /// Add middleware to every resource handler; the first added runs
    /// outermost.
    pub fn use_in_resources(&mut self, middleware: ResourceMiddleware) -> Result<()> {
        self.ensure_configurable()?;
        self.resource_middleware.push(middleware);
        Ok(())
    }

    /// Register an observer for changes to resources matching `uri`. The
    /// observer runs as a task once the server starts and publishes through
    /// the handle it receives. Registration advertises the
    /// `resources.subscribe` capability.
    pub fn resource_change_observer<F, Fut>(&mut self, uri: &str, observer: F) -> Result<()>
    where
        F: FnOnce(ResourceChangeHandle) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_configurable()?;
        let resources = self
            .capabilities
            .resources
            .get_or_insert_with(ResourcesCapability::default);
        resources.subscribe = Some(true);

        let parsed = Url::parse(uri)?;
        let pipeline = self.routes.change_pipeline(&parsed);
        if !self.resources.contains_key(uri) {
            Arc::make_mut(&mut self.resources).insert(
                uri.to_string(),
                ResourceDescriptor {
                    uri: uri.to_string(),
                    name: String::new(),
                    description: None,
                    mime_type: None,
                },
            );
        }

        let handle = ResourceChangeHandle {
            pipeline,
            cancel: self.root.child_token(),
        };
        self.observers.lock().unwrap().push(Box::pin(observer(handle)));
        Ok(())
    }

    /// Register an observer for resource-list changes. Registration
    /// advertises the `resources.listChanged` capability.
    pub fn resource_list_change_observer<F, Fut>(&mut self, observer: F) -> Result<()>
    where
        F: FnOnce(ResourceListChangeHandle) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_configurable()?;
        let resources = self
            .capabilities
            .resources
            .get_or_insert_with(ResourcesCapability::default);
        resources.list_changed = Some(true);

        let handle = ResourceListChangeHandle {
            pipeline: self.list_pipeline.clone(),
            cancel: self.root.child_token(),
        };
        self.observers.lock().unwrap().push(Box::pin(observer(handle)));
        Ok(())
    }

    /// Token cancelled when the server shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Cancel the root context: connections end and notifiers clean up.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub(crate) fn subscribe_enabled(&self) -> bool {
        self.capabilities
            .resources
            .as_ref()
            .and_then(|r| r.subscribe)
            .unwrap_or(false)
    }

    pub(crate) fn list_changed_enabled(&self) -> bool {
        self.capabilities
            .resources
            .as_ref()
            .and_then(|r| r.list_changed)
            .unwrap_or(false)
    }

    pub(crate) async fn session_context(
        &self,
        session_id: &str,
    ) -> Result<CancellationToken> {
        self.sessions.context(session_id).await
    }

    /// Discard a session and every subscription tied to it.
    pub(crate) async fn terminate_session(&self, session_id: &str) {
        let _ = self.sessions.discard(session_id).await;
        let _ = self
            .resource_subscriptions
            .delete_by_session(session_id)
            .await;
        let _ = self.list_subscriptions.unsubscribe(session_id).await;
    }

    /// Freeze configuration: apply global middleware, spawn observers and
    /// share the instance. Must run inside a tokio runtime.
    pub fn finalize(mut self) -> Result<Arc<McpServer>> {
        self.ensure_configurable()?;
        self.started = true;

        let tool_middleware = std::mem::take(&mut self.tool_middleware);
        for tool in self.tools.values_mut() {
            let mut handler = tool.handler.clone();
            for middleware in tool_middleware.iter().rev() {
                handler = middleware(handler);
            }
            tool.handler = handler;
        }

        let resource_middleware = std::mem::take(&mut self.resource_middleware);
        for middleware in resource_middleware.iter().rev() {
            self.routes.apply_middleware(&|handler| middleware(handler));
        }

        let observers = std::mem::take(&mut *self.observers.lock().unwrap());
        info!(name = %self.name, observers = observers.len(), "server starting");
        let server = Arc::new(self);
        for observer in observers {
            tokio::spawn(observer);
        }
        Ok(server)
    }

    /// Serve a single connection on the process's stdin/stdout.
    pub async fn serve_stdio(self) -> Result<()> {
        let server = self.finalize()?;
        StdioTransport::new().serve(server).await
    }

    /// Serve the streamable HTTP endpoint until shutdown.
    pub async fn serve_streamable(self, transport: StreamableHttpTransport) -> Result<()> {
        let server = self.finalize()?;
        transport.serve(server).await
    }
}
