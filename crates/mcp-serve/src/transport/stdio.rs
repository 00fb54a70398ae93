//! stdio transport: newline-framed JSON-RPC over an in/out stream pair.
//!
//! Exactly one logical connection per process. The session ID is latched in
//! memory by the first `initialize`; it never appears on the wire.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::protocol::types::{JsonRpcError, JsonRpcMessage};
use crate::server::McpServer;
use crate::transport::Conn;

/// stdio transport over arbitrary byte streams; [`StdioTransport::new`]
/// binds the process's stdin/stdout.
pub struct StdioTransport<R = tokio::io::Stdin, W = tokio::io::Stdout> {
    input: R,
    output: W,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            input: tokio::io::stdin(),
            output: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Run the transport over the given stream pair; used by tests to drive
    /// the loop through in-memory pipes.
    pub fn with_streams(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Serve the single stdio connection until EOF or shutdown.
    pub async fn serve(self, server: Arc<McpServer>) -> Result<()> {
        info!("serving MCP on stdio");

        let (out_tx, mut out_rx) = mpsc::channel::<JsonRpcMessage>(64);
        let cancel = server.cancellation().child_token();
        let conn = Conn::new(out_tx.clone(), cancel.clone());

        // Single writer task: responses and notifications interleave at
        // message boundaries, one JSON object per line.
        let mut output = self.output;
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        error!(error = %err, "failed to serialize outbound message");
                        continue;
                    }
                };
                debug!(line = %line, "stdio send");
                if output.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if output.write_all(b"\n").await.is_err() {
                    break;
                }
                if output.flush().await.is_err() {
                    break;
                }
            }
            let _ = output.shutdown().await;
        });

        let mut reader = BufReader::new(self.input);
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_line(&mut line) => read?,
            };
            if read == 0 {
                info!("EOF on stdio, shutting down connection");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!(line = %trimmed, "stdio receive");

            let message: JsonRpcMessage = match serde_json::from_str(trimmed) {
                Ok(message) => message,
                Err(err) => {
                    error!(error = %err, "failed to parse inbound message");
                    let response =
                        JsonRpcMessage::error_response(None, JsonRpcError::parse_error());
                    if conn.send(response).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Some(response) = server.handle_message(message, &conn).await {
                if conn.send(response).await.is_err() {
                    break;
                }
            }
        }

        cancel.cancel();
        drop(conn);
        drop(out_tx);
        let _ = writer.await;
        Ok(())
    }
}
