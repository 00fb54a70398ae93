//! Transports: stdio and streamable HTTP.
//!
//! Both hand the dispatcher a [`Conn`]: the per-connection outbound message
//! channel, the session-id latch, the stream-upgrade switch and the
//! connection's cancellation token.

mod http;
mod stdio;

pub use http::StreamableHttpTransport;
pub use stdio::StdioTransport;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::types::JsonRpcMessage;

/// Header carrying the session ID on streamable HTTP requests and responses.
pub const MCP_SESSION_ID: &str = "mcp-session-id";

/// Keep-alive announced when a connection upgrades to an event stream.
pub(crate) const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// One logical connection as seen by the dispatcher.
pub struct Conn {
    outbound: mpsc::Sender<JsonRpcMessage>,
    session_id: Mutex<Option<String>>,
    stream_mode: Mutex<Option<Duration>>,
    cancel: CancellationToken,
}

impl Conn {
    pub(crate) fn new(
        outbound: mpsc::Sender<JsonRpcMessage>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            session_id: Mutex::new(None),
            stream_mode: Mutex::new(None),
            cancel,
        })
    }

    /// Session ID latched on this connection, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.lock().unwrap() = Some(session_id.to_string());
    }

    /// Mark the connection for upgrade to a long-lived event stream. The
    /// first call's keep-alive wins.
    pub fn switch_to_stream(&self, keep_alive: Duration) {
        let mut mode = self.stream_mode.lock().unwrap();
        if mode.is_none() {
            *mode = Some(keep_alive);
        }
    }

    pub fn stream_mode(&self) -> Option<Duration> {
        *self.stream_mode.lock().unwrap()
    }

    /// Token cancelled when the connection ends.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send a server-initiated notification on this connection.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.outbound
            .send(JsonRpcMessage::notification(method, params))
            .await
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    /// Queue a response for delivery on this connection's writer.
    pub(crate) async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }
}

/// Authorizes streamable HTTP requests from the raw `authorization` header
/// value.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, credential: &str) -> Result<()>;
}

/// Authorizer that accepts every request.
pub struct NoopAuthorizer;

#[async_trait]
impl Authorizer for NoopAuthorizer {
    async fn authorize(&self, _credential: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_switch_latches_the_first_keep_alive() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Conn::new(tx, CancellationToken::new());
        assert!(conn.stream_mode().is_none());

        conn.switch_to_stream(Duration::from_secs(5));
        conn.switch_to_stream(Duration::from_secs(30));
        assert_eq!(conn.stream_mode(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn notify_fails_once_the_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        let conn = Conn::new(tx, CancellationToken::new());
        drop(rx);
        assert!(conn.notify("notifications/test", None).await.is_err());
    }
}
