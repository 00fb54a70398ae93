//! Streamable HTTP transport.
//!
//! A single `/mcp` endpoint accepts POST for request/response exchanges,
//! upgrades to a long-lived `text/event-stream` when a handler needs to emit
//! server-initiated notifications, re-attaches streams on GET, and
//! terminates sessions on DELETE.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures::Stream;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::types::{JsonRpcError, JsonRpcMessage, METHOD_INITIALIZE};
use crate::server::McpServer;
use crate::transport::{Authorizer, Conn, NoopAuthorizer, MCP_SESSION_ID, STREAM_KEEP_ALIVE};

/// Outbound channel capacity per HTTP connection.
const OUTBOUND_CAPACITY: usize = 16;

/// Streamable HTTP transport for the `/mcp` endpoint.
pub struct StreamableHttpTransport {
    address: String,
    authorizer: Arc<dyn Authorizer>,
    allow_origins: Vec<String>,
    allow_methods: Vec<String>,
    allow_headers: Vec<String>,
}

impl Default for StreamableHttpTransport {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3001".to_string(),
            authorizer: Arc::new(NoopAuthorizer),
            allow_origins: vec!["*".to_string()],
            allow_methods: vec![
                "POST".to_string(),
                "GET".to_string(),
                "OPTIONS".to_string(),
                "DELETE".to_string(),
            ],
            allow_headers: vec![
                "Accept".to_string(),
                "Content-Type".to_string(),
                "Content-Length".to_string(),
                "Accept-Encoding".to_string(),
                "X-CSRF-Token".to_string(),
                "Authorization".to_string(),
            ],
        }
    }
}

impl StreamableHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address to listen on, `host:port`.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_allow_origins(mut self, origins: Vec<String>) -> Self {
        self.allow_origins = origins;
        self
    }

    pub fn with_allow_methods(mut self, methods: Vec<String>) -> Self {
        self.allow_methods = methods;
        self
    }

    pub fn with_allow_headers(mut self, headers: Vec<String>) -> Self {
        self.allow_headers = headers;
        self
    }

    /// Build the axum router serving `/mcp` for the given server.
    pub fn router(&self, server: Arc<McpServer>) -> Router {
        let state = Arc::new(HttpState {
            server,
            authorizer: self.authorizer.clone(),
        });

        Router::new()
            .route(
                "/mcp",
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .layer(self.cors_layer())
            .with_state(state)
    }

    /// Listen and serve until the server's root cancellation fires.
    pub async fn serve(self, server: Arc<McpServer>) -> Result<()> {
        let shutdown = server.cancellation();
        let app = self.router(server);

        info!(address = %self.address, "serving MCP over streamable HTTP");
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }

    fn cors_layer(&self) -> CorsLayer {
        let mut layer = CorsLayer::new();

        layer = if self.allow_origins.iter().any(|o| o == "*") {
            layer.allow_origin(Any)
        } else {
            let origins: Vec<HeaderValue> = self
                .allow_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            layer.allow_origin(origins)
        };

        let methods: Vec<Method> = self
            .allow_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        let headers: Vec<header::HeaderName> = self
            .allow_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();

        layer
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers([header::HeaderName::from_static(MCP_SESSION_ID)])
    }
}

struct HttpState {
    server: Arc<McpServer>,
    authorizer: Arc<dyn Authorizer>,
}

/// POST /mcp: dispatch a single JSON-RPC request; upgrade to an event
/// stream when the handler switched the connection.
async fn handle_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }

    let message: JsonRpcMessage = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "failed to parse request body");
            return Json(JsonRpcMessage::error_response(
                None,
                JsonRpcError::parse_error(),
            ))
            .into_response();
        }
    };

    let is_initialize = message.method.as_deref() == Some(METHOD_INITIALIZE);
    let session_id = match session_gate(&state, &headers, is_initialize).await {
        Ok(session_id) => session_id,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let cancel = state.server.cancellation().child_token();
    let conn = Conn::new(tx, cancel);
    if let Some(session_id) = &session_id {
        conn.set_session_id(session_id);
    }

    debug!(method = ?message.method, "http dispatch");
    let response = state.server.handle_message(message, &conn).await;

    if let Some(keep_alive) = conn.stream_mode() {
        return stream_response(conn, rx, response, keep_alive);
    }

    let mut http_response = match response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    attach_session_header(&mut http_response, &conn);
    http_response
}

/// GET /mcp: re-attach the event stream for an existing session. The
/// recovery sweep rebinds stale notifiers to this connection.
async fn handle_get(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let session_id = match require_session(&state, &headers).await {
        Ok(session_id) => session_id,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let cancel = state.server.cancellation().child_token();
    let conn = Conn::new(tx, cancel);
    conn.set_session_id(&session_id);
    conn.switch_to_stream(STREAM_KEEP_ALIVE);

    state.server.recover_subscriptions(&session_id, &conn).await;

    stream_response(conn, rx, None, STREAM_KEEP_ALIVE)
}

/// DELETE /mcp: terminate the session named by the session header.
async fn handle_delete(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let session_id = match require_session(&state, &headers).await {
        Ok(session_id) => session_id,
        Err(response) => return response,
    };

    state.server.terminate_session(&session_id).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn authorize(state: &HttpState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Err(err) = state.authorizer.authorize(credential).await {
        warn!(error = %err, "authorize failed");
        return Err((StatusCode::UNAUTHORIZED, "authorize failed").into_response());
    }
    Ok(())
}

/// Enforce the session-header rules: missing on a non-initialize request is
/// a 400, present but unknown is a 404.
async fn session_gate(
    state: &HttpState,
    headers: &HeaderMap,
    is_initialize: bool,
) -> std::result::Result<Option<String>, Response> {
    let session_id = headers
        .get(MCP_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if is_initialize {
        return Ok(session_id);
    }

    let Some(session_id) = session_id else {
        return Err((StatusCode::BAD_REQUEST, "missing mcp-session-id header").into_response());
    };
    if state.server.session_context(&session_id).await.is_err() {
        return Err((StatusCode::NOT_FOUND, "session not found").into_response());
    }
    Ok(Some(session_id))
}

async fn require_session(
    state: &HttpState,
    headers: &HeaderMap,
) -> std::result::Result<String, Response> {
    match session_gate(state, headers, false).await? {
        Some(session_id) => Ok(session_id),
        None => Err((StatusCode::BAD_REQUEST, "missing mcp-session-id header").into_response()),
    }
}

fn attach_session_header(response: &mut Response, conn: &Conn) {
    if let Some(session_id) = conn.session_id() {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response
                .headers_mut()
                .insert(header::HeaderName::from_static(MCP_SESSION_ID), value);
        }
    }
}

/// Cancels the connection token when the client goes away and the response
/// stream is dropped.
struct ConnGuard(Arc<Conn>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.cancellation().cancel();
    }
}

fn event_stream(
    conn: Arc<Conn>,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    first: Option<JsonRpcMessage>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = ConnGuard(conn.clone());
        if let Some(message) = first {
            if let Ok(data) = serde_json::to_string(&message) {
                yield Ok(Event::default().event("message").data(data));
            }
        }
        let cancelled = conn.cancellation();
        loop {
            let received = tokio::select! {
                _ = cancelled.cancelled() => None,
                received = outbound.recv() => received,
            };
            let Some(message) = received else { break };
            if let Ok(data) = serde_json::to_string(&message) {
                yield Ok(Event::default().event("message").data(data));
            }
        }
    }
}

/// Upgrade the HTTP response to a long-lived event stream: the JSON-RPC
/// response (if any) is the first frame, subsequent frames drain the
/// connection's outbound notifications. Comment heartbeats tick at 80% of
/// the keep-alive interval.
fn stream_response(
    conn: Arc<Conn>,
    outbound: mpsc::Receiver<JsonRpcMessage>,
    first: Option<JsonRpcMessage>,
    keep_alive: Duration,
) -> Response {
    let session_id = conn.session_id();
    let heartbeat = keep_alive.mul_f64(0.8);
    let stream = event_stream(conn, outbound, first);

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(value) = HeaderValue::from_str(&format!("timeout={}", keep_alive.as_secs())) {
        headers.insert(header::HeaderName::from_static("keep-alive"), value);
    }
    if let Some(session_id) = session_id {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            headers.insert(header::HeaderName::from_static(MCP_SESSION_ID), value);
        }
    }
    response
}
