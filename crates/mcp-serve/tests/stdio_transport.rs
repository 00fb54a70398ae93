//! End-to-end tests for the stdio transport: newline-framed JSON-RPC over
//! an in-memory stream pair.

use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;

use mcp_serve::{
    McpServer, ResourceChangeHandle, ResourceContext, StdioTransport, ToolContext,
};

type ClientReader = tokio::io::Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>;
type ClientWriter = WriteHalf<tokio::io::DuplexStream>;

fn build_server() -> (McpServer, oneshot::Receiver<ResourceChangeHandle>) {
    let mut server = McpServer::new("stdio-test");
    server
        .tool(
            "add",
            json!({
                "type": "object",
                "properties": {"x": {"type": "number"}, "y": {"type": "number"}},
                "required": ["x", "y"]
            }),
            |c: &mut ToolContext| -> mcp_serve::Result<()> {
                let args: Value = c.bind()?;
                let sum = args["x"].as_f64().unwrap_or(0.0) + args["y"].as_f64().unwrap_or(0.0);
                c.json(&json!({"result": sum}))
            },
        )
        .unwrap();
    server
        .resource(
            "user",
            "example://e.com/{id}",
            |c: &mut ResourceContext| -> mcp_serve::Result<()> {
                let id = c.param("id").to_string();
                c.json(&json!({"id": id, "name": "Bob"}))
            },
        )
        .unwrap();
    let (handle_tx, handle_rx) = oneshot::channel();
    server
        .resource_change_observer("example://e.com/{id}", move |handle| async move {
            let _ = handle_tx.send(handle);
        })
        .unwrap();
    (server, handle_rx)
}

async fn start() -> (ClientWriter, ClientReader, oneshot::Receiver<ResourceChangeHandle>) {
    let (server_builder, handle_rx) = build_server();
    let server = server_builder.finalize().unwrap();

    let (client_end, server_end) = duplex(1 << 16);
    let (server_read, server_write) = tokio::io::split(server_end);
    tokio::spawn(StdioTransport::with_streams(server_read, server_write).serve(server));

    let (client_read, client_write) = tokio::io::split(client_end);
    let reader = BufReader::new(client_read).lines();
    (client_write, reader, handle_rx)
}

async fn send(writer: &mut ClientWriter, message: Value) {
    let mut line = message.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await.unwrap();
}

async fn recv(reader: &mut ClientReader) -> Value {
    let line = timeout(Duration::from_secs(2), reader.next_line())
        .await
        .expect("line within deadline")
        .expect("read succeeds")
        .expect("stream open");
    serde_json::from_str(&line).expect("valid JSON per line")
}

async fn initialize(writer: &mut ClientWriter, reader: &mut ClientReader) -> Value {
    send(
        writer,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "stdio-client", "version": "0.1.0"}
            }
        }),
    )
    .await;
    recv(reader).await
}

#[tokio::test]
async fn initialize_then_tool_call() {
    let (mut writer, mut reader, _handle) = start().await;

    let response = initialize(&mut writer, &mut reader).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(response["result"]["serverInfo"]["name"], "stdio-test");

    send(
        &mut writer,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "add", "arguments": {"x": 1.5, "y": 2.5}}
        }),
    )
    .await;
    let response = recv(&mut reader).await;
    assert_eq!(response["result"]["type"], "text");
    assert_eq!(response["result"]["text"], r#"{"result":4.0}"#);
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let (mut writer, mut reader, _handle) = start().await;

    send(&mut writer, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
    let response = recv(&mut reader).await;
    assert_eq!(response["error"]["code"], -32001);
}

#[tokio::test]
async fn malformed_lines_get_a_parse_error() {
    let (mut writer, mut reader, _handle) = start().await;

    writer.write_all(b"this is not json\n").await.unwrap();
    let response = recv(&mut reader).await;
    assert_eq!(response["error"]["code"], -32700);
}

#[tokio::test]
async fn template_resource_read_over_the_wire() {
    let (mut writer, mut reader, _handle) = start().await;
    initialize(&mut writer, &mut reader).await;

    send(
        &mut writer,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "resources/read",
            "params": {"uri": "example://e.com/42"}
        }),
    )
    .await;
    let response = recv(&mut reader).await;
    assert_eq!(
        response["result"]["contents"][0]["text"],
        r#"{"id":"42","name":"Bob"}"#
    );
}

#[tokio::test]
async fn subscription_notifications_share_the_connection() {
    let (mut writer, mut reader, handle_rx) = start().await;
    initialize(&mut writer, &mut reader).await;
    let handle = handle_rx.await.unwrap();

    send(
        &mut writer,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "resources/subscribe",
            "params": {"uri": "example://e.com/{id}"}
        }),
    )
    .await;
    let response = recv(&mut reader).await;
    assert_eq!(response["result"], json!({}));

    let uri = url::Url::parse("example://e.com/7").unwrap();
    handle.publish(&uri, SystemTime::now() + Duration::from_secs(1));

    let note = recv(&mut reader).await;
    assert_eq!(note["method"], "notifications/resources/updated");
    assert_eq!(note["params"]["uri"], "example://e.com/7");
    assert!(note.get("id").is_none());
}
