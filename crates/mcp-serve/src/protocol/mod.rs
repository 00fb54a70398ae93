//! MCP protocol: message types, capability advertisement and the request
//! dispatcher.

pub mod capabilities;
mod handler;
pub mod types;

pub use capabilities::{
    LoggingCapability, PromptsCapability, ResourcesCapability, ServerCapabilities, ToolsCapability,
};
pub use handler::negotiate_protocol_version;
pub use types::{JsonRpcError, JsonRpcMessage};
