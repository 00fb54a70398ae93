//! Minimal MCP server: one tool, one resource, stdio transport.
//!
//! Run with `cargo run --example echo`, then speak JSON-RPC on stdin:
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"demo","version":"0"}}}
//! {"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}
//! ```

use mcp_serve::{McpServer, ResourceContext, ToolContext};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
struct EchoArgs {
    message: String,
}

#[tokio::main]
async fn main() -> mcp_serve::Result<()> {
    let mut server = McpServer::new("echo");

    server.tool(
        "echo",
        json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        }),
        |c: &mut ToolContext| -> mcp_serve::Result<()> {
            let args: EchoArgs = c.bind()?;
            c.text(args.message)
        },
    )?;

    server.resource(
        "motd",
        "echo://local/motd",
        |c: &mut ResourceContext| -> mcp_serve::Result<()> { c.text("hello from mcp-serve") },
    )?;

    server.serve_stdio().await
}
