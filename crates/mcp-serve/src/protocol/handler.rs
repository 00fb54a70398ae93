//! The protocol engine: request dispatch, session wiring, subscription
//! notifiers and the post-handle recovery sweep.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::change::{ListChangeSubscriber, ResourceChangePipeline, ResourceChangeSubscriber};
use crate::context::{ResourceContext, ResourceListContext, ToolContext};
use crate::error::{Error, Result};
use crate::protocol::types::*;
use crate::server::McpServer;
use crate::subscription::Subscription;
use crate::transport::{Conn, STREAM_KEEP_ALIVE};

/// Echo the client's protocol version when supported, otherwise answer with
/// the latest one this server speaks.
pub fn negotiate_protocol_version(requested: &str) -> &str {
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
        requested
    } else {
        LATEST_PROTOCOL_VERSION
    }
}

fn parse_params<T: DeserializeOwned>(message: &JsonRpcMessage) -> Result<T> {
    let params = message
        .params
        .clone()
        .ok_or_else(|| Error::InvalidParams("missing params".to_string()))?;
    serde_json::from_value(params).map_err(|err| Error::InvalidParams(err.to_string()))
}

impl McpServer {
    /// Handle one framed message from a connection. Requests produce a
    /// response; notifications and stray responses produce none.
    pub(crate) async fn handle_message(
        self: &Arc<Self>,
        message: JsonRpcMessage,
        conn: &Arc<Conn>,
    ) -> Option<JsonRpcMessage> {
        if message.is_request() {
            let id = message.id.clone().unwrap_or(Value::Null);
            let method = message.method.clone().unwrap_or_default();
            debug!(method = %method, "handling request");

            let result = if method == METHOD_INITIALIZE {
                self.handle_initialize(&message, conn).await
            } else {
                match conn.session_id() {
                    None => Err(Error::UnknownSession),
                    Some(session_id) => {
                        let out = self.invoke_method(&method, &message, &session_id, conn).await;
                        self.recover_subscriptions(&session_id, conn).await;
                        out
                    }
                }
            };

            Some(match result {
                Ok(result) => JsonRpcMessage::response(id, result),
                Err(err) => {
                    warn!(method = %method, error = %err, "request failed");
                    JsonRpcMessage::error_response(Some(id), err.to_jsonrpc())
                }
            })
        } else if message.is_notification() {
            let method = message.method.as_deref().unwrap_or_default();
            match method {
                NOTIFICATION_INITIALIZED => info!("client initialized"),
                NOTIFICATION_CANCELLED => debug!("request cancelled"),
                other => debug!(method = %other, "ignoring notification"),
            }
            None
        } else {
            debug!("received unexpected response message");
            None
        }
    }

    async fn invoke_method(
        self: &Arc<Self>,
        method: &str,
        message: &JsonRpcMessage,
        session_id: &str,
        conn: &Arc<Conn>,
    ) -> Result<Value> {
        let session = self
            .sessions
            .context(session_id)
            .await
            .map_err(|_| Error::UnknownSession)?;
        if session.is_cancelled() {
            return Err(Error::UnknownSession);
        }

        match method {
            METHOD_PING => Ok(serde_json::json!({})),
            METHOD_RESOURCES_LIST => self.handle_resources_list(message).await,
            METHOD_RESOURCES_TEMPLATES_LIST => {
                let result = ListResourceTemplatesResult {
                    resource_templates: self.templates.values().cloned().collect(),
                };
                Ok(serde_json::to_value(result)?)
            }
            METHOD_RESOURCES_READ => self.handle_resources_read(message).await,
            METHOD_PROMPTS_LIST | METHOD_PROMPTS_GET => {
                Err(Error::NotHandled(method.to_string()))
            }
            METHOD_TOOLS_LIST => {
                let result = ListToolsResult {
                    next_cursor: None,
                    tools: self.tools.values().map(|t| t.descriptor.clone()).collect(),
                };
                Ok(serde_json::to_value(result)?)
            }
            METHOD_TOOLS_CALL => self.handle_tools_call(message).await,
            METHOD_RESOURCES_SUBSCRIBE => {
                if !self.subscribe_enabled() {
                    return Err(Error::MethodNotFound(method.to_string()));
                }
                let params: SubscribeResourceParams = parse_params(message)?;
                let uri = Url::parse(&params.uri)
                    .map_err(|err| Error::InvalidParams(err.to_string()))?;
                self.setup_resource_subscription(session_id, &uri, conn)
                    .await?;
                Ok(serde_json::json!({}))
            }
            METHOD_RESOURCES_UNSUBSCRIBE => {
                let params: SubscribeResourceParams = parse_params(message)?;
                let uri = Url::parse(&params.uri)
                    .map_err(|err| Error::InvalidParams(err.to_string()))?;
                self.resource_subscriptions
                    .unsubscribe(session_id, &uri)
                    .await?;
                Ok(serde_json::json!({}))
            }
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    async fn handle_initialize(
        self: &Arc<Self>,
        message: &JsonRpcMessage,
        conn: &Arc<Conn>,
    ) -> Result<Value> {
        let params: InitializeParams = parse_params(message)?;
        info!(
            client = %params.client_info.name,
            version = %params.client_info.version,
            "initializing session"
        );

        let session_id = self.sessions.start().await?;
        conn.set_session_id(&session_id);

        if self.list_changed_enabled() {
            let session = self.sessions.context(&session_id).await?;
            self.start_list_change_notifier(&session_id, session, conn)
                .await?;
        }

        let result = InitializeResult {
            protocol_version: negotiate_protocol_version(&params.protocol_version).to_string(),
            capabilities: self.capabilities.clone(),
            server_info: Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
            },
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_resources_list(self: &Arc<Self>, message: &JsonRpcMessage) -> Result<Value> {
        let mut ctx = ResourceListContext::new(self.resources.clone(), Some(message.clone()));
        self.list_handler.handle(&mut ctx).await?;
        let result = ListResourcesResult {
            resources: ctx.into_resources(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_resources_read(self: &Arc<Self>, message: &JsonRpcMessage) -> Result<Value> {
        let params: ReadResourceParams = parse_params(message)?;
        let uri = Url::parse(&params.uri).map_err(|err| Error::InvalidParams(err.to_string()))?;
        let route = self.routes.matching(&uri)?;

        let mut ctx =
            ResourceContext::new(uri, route.mime_type.clone(), route.params, Some(message.clone()));
        route.handler.handle(&mut ctx).await?;
        let result = ReadResourceResult {
            contents: ctx.into_contents(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_tools_call(self: &Arc<Self>, message: &JsonRpcMessage) -> Result<Value> {
        let params: CallToolParams = parse_params(message)?;
        let tool = self
            .tools
            .get(&params.name)
            .ok_or_else(|| Error::ToolNotFound(params.name.clone()))?;
        debug!(tool = %params.name, "calling tool");

        let mut ctx = ToolContext::new(
            params.name.clone(),
            params.arguments,
            tool.descriptor.annotations.clone(),
            Some(message.clone()),
        );
        tool.handler.handle(&mut ctx).await.map_err(|err| Error::Tool {
            name: params.name.clone(),
            message: err.to_string(),
        })?;

        match ctx.into_content() {
            Some(content) => Ok(serde_json::to_value(content)?),
            None => Ok(Value::Null),
        }
    }

    /// Register a change subscriber for `uri` and run its notifier on this
    /// connection. The subscribe response is written before the notifier can
    /// deliver anything.
    pub(crate) async fn setup_resource_subscription(
        self: &Arc<Self>,
        session_id: &str,
        uri: &Url,
        conn: &Arc<Conn>,
    ) -> Result<()> {
        let route = self.routes.matching(uri)?;

        let subscriber_id = format!("{}#{}", uri, session_id);
        let (subscriber, rx) = ResourceChangeSubscriber::new(subscriber_id.clone(), uri.clone());
        route.change.subscribe(subscriber);

        let subscription = self
            .resource_subscriptions
            .subscribe(session_id, uri)
            .await?;
        let session = self.sessions.context(session_id).await?;

        conn.switch_to_stream(STREAM_KEEP_ALIVE);
        self.spawn_resource_notifier(
            route.change,
            subscriber_id,
            rx,
            subscription,
            session,
            conn.clone(),
        );
        Ok(())
    }

    fn spawn_resource_notifier(
        self: &Arc<Self>,
        pipeline: Arc<ResourceChangePipeline>,
        subscriber_id: String,
        mut rx: mpsc::Receiver<Url>,
        subscription: Subscription,
        session: CancellationToken,
        conn: Arc<Conn>,
    ) {
        let health_interval = self.resource_subscriptions.health_interval();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + health_interval;
            let mut ticker = tokio::time::interval_at(start, health_interval);
            let unsubscribed = subscription.unsubscribed();
            let connection = conn.cancellation();
            loop {
                tokio::select! {
                    _ = ticker.tick() => subscription.signal_alive(),
                    _ = session.cancelled() => {
                        pipeline.unsubscribe(&subscriber_id);
                        return;
                    }
                    _ = unsubscribed.cancelled() => {
                        pipeline.unsubscribe(&subscriber_id);
                        return;
                    }
                    _ = connection.cancelled() => {
                        pipeline.unsubscribe(&subscriber_id);
                        return;
                    }
                    received = rx.recv() => match received {
                        Some(uri) => {
                            let params = serde_json::json!({ "uri": uri.to_string() });
                            if conn
                                .notify(NOTIFICATION_RESOURCES_UPDATED, Some(params))
                                .await
                                .is_err()
                            {
                                // The sweep re-establishes this subscription on
                                // the session's next request; the replacement
                                // subscriber overwrites this registry entry.
                                debug!(subscriber = %subscriber_id, "notifier write failed");
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });
    }

    /// Wire the per-session resource-list-change notifier onto this
    /// connection.
    pub(crate) async fn start_list_change_notifier(
        self: &Arc<Self>,
        session_id: &str,
        session: CancellationToken,
        conn: &Arc<Conn>,
    ) -> Result<()> {
        let (subscriber, mut rx) = ListChangeSubscriber::new(session_id.to_string());
        self.list_pipeline.subscribe(subscriber);

        let subscription = self.list_subscriptions.subscribe(session_id).await?;
        conn.switch_to_stream(STREAM_KEEP_ALIVE);

        let pipeline = self.list_pipeline.clone();
        let subscriber_id = session_id.to_string();
        let health_interval = self.list_subscriptions.health_interval();
        let conn = conn.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + health_interval;
            let mut ticker = tokio::time::interval_at(start, health_interval);
            let unsubscribed = subscription.unsubscribed();
            let connection = conn.cancellation();
            loop {
                tokio::select! {
                    _ = ticker.tick() => subscription.signal_alive(),
                    _ = session.cancelled() => {
                        pipeline.unsubscribe(&subscriber_id);
                        return;
                    }
                    _ = unsubscribed.cancelled() => {
                        pipeline.unsubscribe(&subscriber_id);
                        return;
                    }
                    _ = connection.cancelled() => {
                        pipeline.unsubscribe(&subscriber_id);
                        return;
                    }
                    received = rx.recv() => match received {
                        Some(()) => {
                            if conn
                                .notify(
                                    NOTIFICATION_RESOURCES_LIST_CHANGED,
                                    Some(Value::Null),
                                )
                                .await
                                .is_err()
                            {
                                debug!(subscriber = %subscriber_id, "notifier write failed");
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });
        Ok(())
    }

    /// Post-handle sweep: re-establish notifiers for subscriptions that
    /// missed their health window, typically after a notifier died on a
    /// transport write failure.
    pub(crate) async fn recover_subscriptions(
        self: &Arc<Self>,
        session_id: &str,
        conn: &Arc<Conn>,
    ) {
        if !self.subscribe_enabled() && !self.list_changed_enabled() {
            return;
        }

        let uris = match self.resource_subscriptions.unhealthy_uris(session_id).await {
            Ok(uris) => uris,
            Err(_) => return,
        };
        for uri in uris {
            debug!(uri = %uri, "re-establishing stale resource subscription");
            if let Err(err) = self.setup_resource_subscription(session_id, &uri, conn).await {
                debug!(uri = %uri, error = %err, "failed to re-establish subscription");
            }
        }

        if let Ok(false) = self.list_subscriptions.health(session_id).await {
            if let Ok(session) = self.sessions.context(session_id).await {
                debug!("re-establishing stale list-change subscription");
                if let Err(err) = self
                    .start_list_change_notifier(session_id, session, conn)
                    .await
                {
                    debug!(error = %err, "failed to re-establish list-change subscription");
                }
            }
        }
    }
}
