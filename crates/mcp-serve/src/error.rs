//! Error types for mcp-serve

use thiserror::Error;

use crate::protocol::types::JsonRpcError;

/// Result type alias for framework operations
pub type Result<T> = std::result::Result<T, Error>;

/// Framework error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("server is already running or there is a configuration process conflict")]
    LockingConflict,

    #[error("unknown session")]
    UnknownSession,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("method not handled: {0}")]
    NotHandled(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("scheme '{0}' not found")]
    SchemeNotFound(String),

    #[error("host '{0}' not found")]
    HostNotFound(String),

    #[error("path '{0}' not found")]
    PathNotFound(String),

    #[error("'{0}' found, but not registered as a resource")]
    NotRoutable(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("failed to handle Tool (name: {name}): {message}")]
    Tool { name: String, message: String },

    #[error("resource modification subscription not found")]
    ResourceSubscriptionNotFound,

    #[error("resource list subscription not found")]
    ListSubscriptionNotFound,

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid URI: {0}")]
    UriParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// JSON-RPC error code this error maps to on the wire.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Error::UnknownSession | Error::SessionNotFound(_) => -32001,
            Error::MethodNotFound(_) | Error::NotHandled(_) => -32601,
            Error::InvalidParams(_) | Error::ToolNotFound(_) => -32602,
            _ => -32603,
        }
    }

    /// Convert into a wire-level JSON-RPC error object.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        JsonRpcError::new(self.jsonrpc_code(), self.to_string())
    }
}
