//! Per-request context objects handed to tool, resource and resource-list
//! handlers. Each context binds the request's inputs and collects the
//! handler's output through typed write helpers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::Result;
use crate::protocol::types::{
    JsonRpcMessage, ResourceContents, ResourceDescriptor, ToolAnnotations, ToolContent,
};

fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Request-scoped state shared by all context variants: the originating
/// JSON-RPC request and a free-form scratch map.
#[derive(Debug, Default)]
struct RequestScope {
    request: Option<JsonRpcMessage>,
    store: HashMap<String, Value>,
}

/// Handler for a registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ToolContext) -> Result<()>;
}

/// Plain functions double as tool handlers.
#[async_trait]
impl<F> ToolHandler for F
where
    F: Fn(&mut ToolContext) -> Result<()> + Send + Sync,
{
    async fn handle(&self, ctx: &mut ToolContext) -> Result<()> {
        self(ctx)
    }
}

/// Handler for reading a registered resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ResourceContext) -> Result<()>;
}

#[async_trait]
impl<F> ResourceHandler for F
where
    F: Fn(&mut ResourceContext) -> Result<()> + Send + Sync,
{
    async fn handle(&self, ctx: &mut ResourceContext) -> Result<()> {
        self(ctx)
    }
}

/// Handler for `resources/list`.
#[async_trait]
pub trait ResourceListHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ResourceListContext) -> Result<()>;
}

#[async_trait]
impl<F> ResourceListHandler for F
where
    F: Fn(&mut ResourceListContext) -> Result<()> + Send + Sync,
{
    async fn handle(&self, ctx: &mut ResourceListContext) -> Result<()> {
        self(ctx)
    }
}

/// Context for tool handlers.
///
/// Exactly one write helper call decides the result content; a later call
/// replaces an earlier one.
pub struct ToolContext {
    scope: RequestScope,
    tool_name: String,
    arguments: Option<Value>,
    annotations: Option<ToolAnnotations>,
    dest: Option<ToolContent>,
}

impl ToolContext {
    pub fn new(
        tool_name: String,
        arguments: Option<Value>,
        annotations: Option<ToolAnnotations>,
        request: Option<JsonRpcMessage>,
    ) -> Self {
        Self {
            scope: RequestScope {
                request,
                store: HashMap::new(),
            },
            tool_name,
            arguments,
            annotations,
            dest: None,
        }
    }

    /// Name of the tool being invoked
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Raw arguments as received on the wire
    pub fn arguments(&self) -> Option<&Value> {
        self.arguments.as_ref()
    }

    /// Deserialize the arguments into `T`. Empty or absent arguments yield
    /// `T::default()`.
    pub fn bind<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match &self.arguments {
            None | Some(Value::Null) => Ok(T::default()),
            Some(args) => Ok(serde_json::from_value(args.clone())?),
        }
    }

    /// Retrieve scratch data stored with [`ToolContext::set`]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scope.store.get(key)
    }

    /// Save scratch data in the context
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.scope.store.insert(key.into(), value);
    }

    /// The originating JSON-RPC request
    pub fn jsonrpc_request(&self) -> Option<&JsonRpcMessage> {
        self.scope.request.as_ref()
    }

    /// Send plain text content
    pub fn text(&mut self, text: impl Into<String>) -> Result<()> {
        self.dest = Some(ToolContent::Text {
            text: text.into(),
            annotations: self.annotations.clone(),
        });
        Ok(())
    }

    /// Send a value serialized as JSON text content
    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.dest = Some(ToolContent::Text {
            text,
            annotations: self.annotations.clone(),
        });
        Ok(())
    }

    /// Send image content; `data` is base64-encoded for the wire
    pub fn image(&mut self, data: &[u8], mime_type: &str) -> Result<()> {
        self.dest = Some(ToolContent::Image {
            data: base64_encode(data),
            mime_type: mime_type.to_string(),
        });
        Ok(())
    }

    /// Send audio content; `data` is base64-encoded for the wire
    pub fn audio(&mut self, data: &[u8], mime_type: &str) -> Result<()> {
        self.dest = Some(ToolContent::Audio {
            data: base64_encode(data),
            mime_type: mime_type.to_string(),
        });
        Ok(())
    }

    /// Send an embedded resource whose body is a JSON document
    pub fn json_resource<T: Serialize>(
        &mut self,
        uri: &Url,
        value: &T,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.dest = Some(ToolContent::Resource {
            resource: ResourceContents::Text {
                uri: uri.to_string(),
                mime_type: Some(mime_type.unwrap_or("application/json").to_string()),
                text,
            },
        });
        Ok(())
    }

    /// Send an embedded resource with text contents
    pub fn string_resource(
        &mut self,
        uri: &Url,
        text: impl Into<String>,
        mime_type: Option<&str>,
    ) -> Result<()> {
        self.dest = Some(ToolContent::Resource {
            resource: ResourceContents::Text {
                uri: uri.to_string(),
                mime_type: Some(mime_type.unwrap_or("text/plain").to_string()),
                text: text.into(),
            },
        });
        Ok(())
    }

    /// Send an embedded resource with binary contents
    pub fn binary_resource(
        &mut self,
        uri: &Url,
        data: &[u8],
        mime_type: Option<&str>,
    ) -> Result<()> {
        self.dest = Some(ToolContent::Resource {
            resource: ResourceContents::Blob {
                uri: uri.to_string(),
                mime_type: Some(mime_type.unwrap_or("application/octet-stream").to_string()),
                blob: base64_encode(data),
            },
        });
        Ok(())
    }

    pub(crate) fn into_content(self) -> Option<ToolContent> {
        self.dest
    }
}

/// Context for resource handlers. A read may produce several content parts;
/// each write helper appends one.
pub struct ResourceContext {
    scope: RequestScope,
    uri: Url,
    mime_type: Option<String>,
    params: HashMap<String, String>,
    contents: Vec<ResourceContents>,
}

impl ResourceContext {
    pub fn new(
        uri: Url,
        mime_type: Option<String>,
        params: HashMap<String, String>,
        request: Option<JsonRpcMessage>,
    ) -> Self {
        Self {
            scope: RequestScope {
                request,
                store: HashMap::new(),
            },
            uri,
            mime_type,
            params,
            contents: Vec::new(),
        }
    }

    /// The concrete URI this read resolved to
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Default MIME type registered for this resource
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Path parameter bound by a `{name}` segment; `""` when unknown.
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scope.store.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.scope.store.insert(key.into(), value);
    }

    pub fn jsonrpc_request(&self) -> Option<&JsonRpcMessage> {
        self.scope.request.as_ref()
    }

    /// Append plain text content
    pub fn text(&mut self, text: impl Into<String>) -> Result<()> {
        self.contents.push(ResourceContents::Text {
            uri: self.uri.to_string(),
            mime_type: Some("text/plain".to_string()),
            text: text.into(),
        });
        Ok(())
    }

    /// Append a value serialized as JSON content
    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let mime_type = self
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/json".to_string());
        self.contents.push(ResourceContents::Text {
            uri: self.uri.to_string(),
            mime_type: Some(mime_type),
            text,
        });
        Ok(())
    }

    /// Append binary content. Falls back to the resource's registered MIME
    /// type when none is given.
    pub fn blob(&mut self, data: &[u8], mime_type: Option<&str>) -> Result<()> {
        let mime_type = mime_type
            .map(str::to_string)
            .or_else(|| self.mime_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        self.contents.push(ResourceContents::Blob {
            uri: self.uri.to_string(),
            mime_type: Some(mime_type),
            blob: base64_encode(data),
        });
        Ok(())
    }

    pub(crate) fn into_contents(self) -> Vec<ResourceContents> {
        self.contents
    }
}

/// Context for the resource-list handler.
pub struct ResourceListContext {
    scope: RequestScope,
    resources: Arc<HashMap<String, ResourceDescriptor>>,
    dest: HashMap<String, ResourceDescriptor>,
}

impl ResourceListContext {
    pub fn new(
        resources: Arc<HashMap<String, ResourceDescriptor>>,
        request: Option<JsonRpcMessage>,
    ) -> Self {
        Self {
            scope: RequestScope {
                request,
                store: HashMap::new(),
            },
            resources,
            dest: HashMap::new(),
        }
    }

    /// Every registered resource, templates included. Templates must be
    /// expanded to concrete URIs before being surfaced with
    /// [`ResourceListContext::set_resource`].
    pub fn resources(&self) -> &HashMap<String, ResourceDescriptor> {
        &self.resources
    }

    /// Surface a resource in the listing, keyed by its concrete URI.
    pub fn set_resource(&mut self, uri: impl Into<String>, resource: ResourceDescriptor) {
        self.dest.insert(uri.into(), resource);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scope.store.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.scope.store.insert(key.into(), value);
    }

    pub fn jsonrpc_request(&self) -> Option<&JsonRpcMessage> {
        self.scope.request.as_ref()
    }

    pub(crate) fn into_resources(self) -> Vec<ResourceDescriptor> {
        self.dest.into_values().collect()
    }
}

/// True when any path segment of `uri` is a `{param}` placeholder.
pub(crate) fn is_template_uri(uri: &str) -> bool {
    uri.split('/')
        .any(|s| crate::routing::wildcard_name(s).is_some())
}

/// Default `resources/list` handler: surfaces every registered resource
/// except templates.
pub fn default_resource_list_handler(c: &mut ResourceListContext) -> Result<()> {
    let resources = Arc::clone(&c.resources);
    for (uri, resource) in resources.iter() {
        if is_template_uri(uri) {
            continue;
        }
        c.set_resource(uri.clone(), resource.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct AddArgs {
        x: f64,
        y: f64,
    }

    #[test]
    fn bind_deserializes_arguments() {
        let ctx = ToolContext::new(
            "add".into(),
            Some(serde_json::json!({"x": 1.5, "y": 2.5})),
            None,
            None,
        );
        let args: AddArgs = ctx.bind().unwrap();
        assert_eq!(args, AddArgs { x: 1.5, y: 2.5 });
    }

    #[test]
    fn bind_with_empty_arguments_succeeds_silently() {
        let ctx = ToolContext::new("add".into(), None, None, None);
        let args: AddArgs = ctx.bind().unwrap();
        assert_eq!(args, AddArgs::default());

        let ctx = ToolContext::new("add".into(), Some(Value::Null), None, None);
        let args: AddArgs = ctx.bind().unwrap();
        assert_eq!(args, AddArgs::default());
    }

    #[test]
    fn text_content_carries_tool_annotations() {
        let annotations = ToolAnnotations {
            title: Some("Add".into()),
            read_only_hint: Some(true),
            ..Default::default()
        };
        let mut ctx = ToolContext::new("add".into(), None, Some(annotations.clone()), None);
        ctx.text("4").unwrap();
        match ctx.into_content() {
            Some(ToolContent::Text { text, annotations: a }) => {
                assert_eq!(text, "4");
                assert_eq!(a, Some(annotations));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn image_content_is_base64_encoded() {
        let mut ctx = ToolContext::new("shot".into(), None, None, None);
        ctx.image(b"hello", "image/png").unwrap();
        match ctx.into_content() {
            Some(ToolContent::Image { data, mime_type }) => {
                assert_eq!(data, "aGVsbG8=");
                assert_eq!(mime_type, "image/png");
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn embedded_resource_defaults_mime_types() {
        let uri = Url::parse("example://e.com/blob").unwrap();
        let mut ctx = ToolContext::new("t".into(), None, None, None);
        ctx.binary_resource(&uri, b"hello", None).unwrap();
        match ctx.into_content() {
            Some(ToolContent::Resource {
                resource: ResourceContents::Blob { mime_type, blob, .. },
            }) => {
                assert_eq!(mime_type.as_deref(), Some("application/octet-stream"));
                assert_eq!(blob, "aGVsbG8=");
            }
            other => panic!("unexpected content: {other:?}"),
        }

        let mut ctx = ToolContext::new("t".into(), None, None, None);
        ctx.json_resource(&uri, &serde_json::json!({"a": 1}), None)
            .unwrap();
        match ctx.into_content() {
            Some(ToolContent::Resource {
                resource: ResourceContents::Text { mime_type, .. },
            }) => assert_eq!(mime_type.as_deref(), Some("application/json")),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn resource_context_appends_multiple_parts() {
        let uri = Url::parse("example://e.com/users/42").unwrap();
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        let mut ctx = ResourceContext::new(uri, Some("application/json".into()), params, None);

        assert_eq!(ctx.param("id"), "42");
        assert_eq!(ctx.param("missing"), "");

        ctx.text("first").unwrap();
        ctx.json(&serde_json::json!({"id": "42"})).unwrap();
        ctx.blob(b"raw", None).unwrap();

        let contents = ctx.into_contents();
        assert_eq!(contents.len(), 3);
        match &contents[1] {
            ResourceContents::Text { mime_type, .. } => {
                // json() inherits the registered MIME type
                assert_eq!(mime_type.as_deref(), Some("application/json"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
        match &contents[2] {
            ResourceContents::Blob { mime_type, .. } => {
                assert_eq!(mime_type.as_deref(), Some("application/json"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn default_list_handler_skips_templates() {
        let mut resources = HashMap::new();
        resources.insert(
            "example://e.com/static".to_string(),
            ResourceDescriptor {
                uri: "example://e.com/static".into(),
                name: "static".into(),
                description: None,
                mime_type: None,
            },
        );
        resources.insert(
            "example://e.com/{id}".to_string(),
            ResourceDescriptor {
                uri: "example://e.com/{id}".into(),
                name: "template".into(),
                description: None,
                mime_type: None,
            },
        );

        let mut ctx = ResourceListContext::new(Arc::new(resources), None);
        default_resource_list_handler(&mut ctx).unwrap();
        let listed = ctx.into_resources();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "static");
    }

    #[test]
    fn fresh_context_carries_nothing_over() {
        // Contexts are rebuilt per request; a new one must expose none of a
        // previous request's name, arguments, scratch data or content.
        let mut first = ToolContext::new(
            "add".into(),
            Some(serde_json::json!({"x": 1})),
            None,
            Some(JsonRpcMessage::request(1, "tools/call", None)),
        );
        first.set("k", serde_json::json!("v"));
        first.text("out").unwrap();

        let second = ToolContext::new("other".into(), None, None, None);
        assert_eq!(second.tool_name(), "other");
        assert!(second.arguments().is_none());
        assert!(second.get("k").is_none());
        assert!(second.jsonrpc_request().is_none());
        assert!(second.into_content().is_none());
    }
}
