//! # mcp-serve
//!
//! Server-side framework for the Model Context Protocol (MCP): a
//! bidirectional JSON-RPC 2.0 protocol by which an AI client discovers and
//! invokes server-provided tools, reads URI-addressable resources and
//! receives asynchronous change notifications.
//!
//! Application code registers handlers; the framework owns request parsing,
//! URI routing, session and connection lifecycle, notification fan-out and
//! subscription liveness. Two transports are built in: stdio and streamable
//! HTTP.
//!
//! ```no_run
//! use mcp_serve::{McpServer, ToolContext};
//!
//! #[tokio::main]
//! async fn main() -> mcp_serve::Result<()> {
//!     let mut server = McpServer::new("adder");
//!     server.tool(
//!         "add",
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": {"x": {"type": "number"}, "y": {"type": "number"}},
//!             "required": ["x", "y"]
//!         }),
//!         |c: &mut ToolContext| -> mcp_serve::Result<()> {
//!             let args: serde_json::Value = c.bind()?;
//!             let sum = args["x"].as_f64().unwrap_or(0.0) + args["y"].as_f64().unwrap_or(0.0);
//!             c.json(&serde_json::json!({"result": sum}))
//!         },
//!     )?;
//!     server.serve_stdio().await
//! }
//! ```

pub mod change;
pub mod context;
pub mod error;
pub mod protocol;
mod routing;
pub mod server;
pub mod session;
pub mod subscription;
pub mod transport;

pub use change::{ResourceChangeHandle, ResourceListChangeHandle};
pub use context::{
    default_resource_list_handler, ResourceContext, ResourceHandler, ResourceListContext,
    ResourceListHandler, ToolContext, ToolHandler,
};
pub use error::{Error, Result};
pub use protocol::types::{
    JsonRpcError, JsonRpcMessage, ResourceContents, ResourceDescriptor, ResourceTemplate,
    ToolAnnotations, ToolContent, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use protocol::{negotiate_protocol_version, ServerCapabilities};
pub use server::{
    McpServer, ResourceMiddleware, ResourceOptions, ToolMiddleware, ToolOptions,
    DEFAULT_HEALTH_INTERVAL,
};
pub use session::{InMemorySessionStore, SessionManager, SessionStore};
pub use subscription::{
    InMemoryListChangeSubscriptionStore, InMemoryResourceSubscriptionStore,
    ListChangeSubscriptionManager, ListChangeSubscriptionStore, ResourceSubscriptionManager,
    ResourceSubscriptionStore, Subscription,
};
pub use transport::{
    Authorizer, Conn, NoopAuthorizer, StdioTransport, StreamableHttpTransport, MCP_SESSION_ID,
};
