//! End-to-end tests for the streamable HTTP transport, driven through the
//! axum router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tower::ServiceExt;

use mcp_serve::{
    Authorizer, McpServer, ResourceChangeHandle, ResourceContext, ResourceListChangeHandle,
    StreamableHttpTransport, ToolContext, MCP_SESSION_ID,
};

fn base_server() -> McpServer {
    let mut server = McpServer::new("http-test");
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
            "item",
            "ex://h/{id}",
            |c: &mut ResourceContext| -> mcp_serve::Result<()> { c.text("item") },
        )
        .unwrap();
    server
}

fn plain_router() -> Router {
    let server = base_server().finalize().unwrap();
    StreamableHttpTransport::new().router(server)
}

fn post(body: Value, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session_id) = session_id {
        builder = builder.header(MCP_SESSION_ID, session_id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "http-client", "version": "0.1.0"}
        }
    })
}

async fn read_json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Pull SSE frames off a streaming body, skipping comment heartbeats.
/// Returns the `data:` payload of the next `event: message` frame.
async fn next_event_data(
    stream: &mut (impl futures::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin),
    buffer: &mut String,
) -> Value {
    loop {
        if let Some(end) = buffer.find("\n\n") {
            let frame = buffer[..end].to_string();
            buffer.drain(..end + 2);
            if frame.starts_with(':') {
                continue;
            }
            let data = frame
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .expect("message frame carries data");
            return serde_json::from_str(data).expect("data payload is JSON");
        }
        let chunk = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("chunk within deadline")
            .expect("stream open")
            .expect("chunk read");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn ping_without_session_header_is_bad_request() {
    let router = plain_router();
    let response = router
        .oneshot(post(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let router = plain_router();
    let response = router
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            Some("bogus"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn initialize_issues_a_session_header() {
    let router = plain_router();
    let response = router
        .clone()
        .oneshot(post(initialize_body(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session_id = response
        .headers()
        .get(MCP_SESSION_ID)
        .expect("session header present")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!session_id.is_empty());

    let body = read_json_body(response).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");

    // The issued session is immediately usable.
    let response = router
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
            Some(&session_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json_body(response).await;
    assert_eq!(body["result"], json!({}));
}

#[tokio::test]
async fn tool_call_round_trip() {
    let router = plain_router();
    let response = router
        .clone()
        .oneshot(post(initialize_body(), None))
        .await
        .unwrap();
    let session_id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

    let response = router
        .oneshot(post(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {"name": "add", "arguments": {"x": 1.5, "y": 2.5}}
            }),
            Some(&session_id),
        ))
        .await
        .unwrap();
    let body = read_json_body(response).await;
    assert_eq!(body["result"]["text"], r#"{"result":4.0}"#);
}

#[tokio::test]
async fn malformed_body_gets_a_parse_error() {
    let router = plain_router();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json_body(response).await;
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn delete_terminates_the_session() {
    let router = plain_router();
    let response = router
        .clone()
        .oneshot(post(initialize_body(), None))
        .await
        .unwrap();
    let session_id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

    let request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header(MCP_SESSION_ID, &session_id)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The session is gone afterwards.
    let response = router
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
            Some(&session_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_without_session_header_is_bad_request() {
    let router = plain_router();
    let request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

struct DenyAll;

#[async_trait::async_trait]
impl Authorizer for DenyAll {
    async fn authorize(&self, _credential: &str) -> mcp_serve::Result<()> {
        Err(mcp_serve::Error::Unauthorized("denied".to_string()))
    }
}

#[tokio::test]
async fn failed_authorization_is_unauthorized() {
    let server = base_server().finalize().unwrap();
    let router = StreamableHttpTransport::new()
        .with_authorizer(Arc::new(DenyAll))
        .router(server);

    let response = router.oneshot(post(initialize_body(), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn preflight_advertises_cors_headers() {
    let router = plain_router();
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/mcp")
        .header(header::ORIGIN, "https://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}

#[tokio::test]
async fn list_change_notification_streams_after_initialize() {
    let mut server = base_server();
    let (handle_tx, handle_rx) = oneshot::channel::<ResourceListChangeHandle>();
    server
        .resource_list_change_observer(move |handle| async move {
            let _ = handle_tx.send(handle);
        })
        .unwrap();
    let router = StreamableHttpTransport::new().router(server.finalize().unwrap());
    let handle = handle_rx.await.unwrap();

    let response = router.oneshot(post(initialize_body(), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert!(response.headers().contains_key(MCP_SESSION_ID));

    let mut stream = response.into_body().into_data_stream();
    let mut buffer = String::new();

    // First frame is the initialize response itself.
    let first = next_event_data(&mut stream, &mut buffer).await;
    assert_eq!(first["id"], 1);
    assert_eq!(first["result"]["capabilities"]["resources"]["listChanged"], true);

    handle.publish(SystemTime::now() + Duration::from_secs(1));

    let note = next_event_data(&mut stream, &mut buffer).await;
    assert_eq!(note["method"], "notifications/resources/list_changed");
    assert!(note["params"].is_null());
}

#[tokio::test]
async fn resource_subscription_streams_updates() {
    let mut server = base_server();
    let (handle_tx, handle_rx) = oneshot::channel::<ResourceChangeHandle>();
    server
        .resource_change_observer("ex://h/{id}", move |handle| async move {
            let _ = handle_tx.send(handle);
        })
        .unwrap();
    let router = StreamableHttpTransport::new().router(server.finalize().unwrap());
    let handle = handle_rx.await.unwrap();

    let response = router
        .clone()
        .oneshot(post(initialize_body(), None))
        .await
        .unwrap();
    let session_id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(post(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "resources/subscribe",
                "params": {"uri": "ex://h/{id}"}
            }),
            Some(&session_id),
        ))
        .await
        .unwrap();
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut stream = response.into_body().into_data_stream();
    let mut buffer = String::new();

    let first = next_event_data(&mut stream, &mut buffer).await;
    assert_eq!(first["id"], 2);
    assert_eq!(first["result"], json!({}));

    let uri = url::Url::parse("ex://h/7").unwrap();
    handle.publish(&uri, SystemTime::now() + Duration::from_secs(1));

    let note = next_event_data(&mut stream, &mut buffer).await;
    assert_eq!(note["method"], "notifications/resources/updated");
    assert_eq!(note["params"]["uri"], "ex://h/7");
}

#[tokio::test]
async fn get_reattaches_an_event_stream() {
    let router = plain_router();
    let response = router
        .clone()
        .oneshot(post(initialize_body(), None))
        .await
        .unwrap();
    let session_id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .header(MCP_SESSION_ID, &session_id)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
