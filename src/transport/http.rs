//! Streamable HTTP transport
//!
//! A single endpoint carries the whole protocol:
//! - POST: JSON-RPC requests and notifications from the client
//! - GET: attach an SSE push stream for server-to-client notifications
//! - DELETE: tear down a session
//! - OPTIONS: CORS preflight
//!
//! Session identity travels in the `MCP-Session-Id` header (or a query
//! parameter, for clients that cannot set headers on an EventSource). The
//! response to `initialize` echoes the newly minted id in the same header.
//!
//! # Example
//!
//! ```rust,no_run
//! use streamable_mcp::dispatch::ProtocolEngine;
//! use streamable_mcp::transport::HttpTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ProtocolEngine::builder()
//!         .server_info("my-server", "1.0.0")
//!         .build();
//!
//!     HttpTransport::new(engine).serve("127.0.0.1:3000").await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::post,
    Router,
};
use tokio_stream::StreamExt;

use crate::dispatch::ProtocolEngine;
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, DEFAULT_PROTOCOL_VERSION};
use crate::session::DEFAULT_SESSION_MAX_AGE;

/// Header carrying the session id in both directions.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header advertising the protocol version the client speaks.
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Query parameters accepted as a session id fallback.
const SESSION_QUERY_KEYS: &[&str] = &["session", "sessionId", "mcp-session-id"];

/// Origins accepted without configuration: local tooling. The trailing colon
/// pins the host, so `http://localhost.evil.example` does not match.
const LOCAL_ORIGIN_PREFIXES: &[&str] = &[
    "http://localhost:",
    "https://localhost:",
    "http://127.0.0.1:",
    "https://127.0.0.1:",
];

struct AppState {
    engine: Arc<ProtocolEngine>,
    validate_origin: bool,
    allowed_origins: Vec<String>,
}

/// Streamable HTTP adapter over a [`ProtocolEngine`].
///
/// # Session expiry
///
/// A background task removes sessions older than the configured maximum age
/// (default 24 hours, counted from creation). Use
/// [`session_max_age`](Self::session_max_age) to tune it.
pub struct HttpTransport {
    engine: Arc<ProtocolEngine>,
    validate_origin: bool,
    allowed_origins: Vec<String>,
    session_max_age: Duration,
}

impl HttpTransport {
    pub fn new(engine: ProtocolEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            validate_origin: true,
            allowed_origins: vec![],
            session_max_age: DEFAULT_SESSION_MAX_AGE,
        }
    }

    /// Maximum session age before the expiry sweep removes it. Age is counted
    /// from session creation, not last activity.
    pub fn session_max_age(mut self, max_age: Duration) -> Self {
        self.session_max_age = max_age;
        self
    }

    /// Additional origins accepted besides localhost. `"*"` accepts any.
    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Disable Origin header validation (not recommended for production).
    pub fn disable_origin_validation(mut self) -> Self {
        self.validate_origin = false;
        self
    }

    /// Shared handle to the engine, for emitting notifications from
    /// application code while the transport runs.
    pub fn engine(&self) -> Arc<ProtocolEngine> {
        self.engine.clone()
    }

    /// Build the axum router. Also starts the background expiry sweep, so
    /// this must run inside a tokio runtime.
    pub fn into_router(self) -> Router {
        let state = self.create_app_state();

        Router::new()
            .route(
                "/",
                post(handle_post)
                    .get(handle_get)
                    .delete(handle_delete)
                    .options(handle_options),
            )
            .layer(axum::middleware::map_response(apply_cors_headers))
            .with_state(state)
    }

    /// Build an axum router mounted under `path`.
    pub fn into_router_at(self, path: &str) -> Router {
        let inner = self.into_router();
        Router::new().nest(path, inner)
    }

    fn create_app_state(self) -> Arc<AppState> {
        let state = Arc::new(AppState {
            engine: self.engine,
            validate_origin: self.validate_origin,
            allowed_origins: self.allowed_origins,
        });

        // Sweep at half the max age, but never more often than once a minute.
        let sweep_state = state.clone();
        let max_age = self.session_max_age;
        let sweep_every = (max_age / 2).max(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let removed = sweep_state.engine.sessions().sweep_expired(max_age);
                if removed > 0 {
                    tracing::info!(removed, "Expired sessions swept");
                }
            }
        });

        state
    }

    /// Bind a TCP listener and serve until the process exits.
    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!("MCP streamable HTTP transport listening on {}", addr);

        axum::serve(listener, self.into_router())
            .await
            .map_err(|e| Error::Transport(format!("Server error: {}", e)))?;
        Ok(())
    }
}

async fn apply_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Accept, MCP-Protocol-Version, MCP-Session-Id"),
    );
    response
}

/// Reject browser requests from non-local origins. Requests without an
/// Origin header (curl, SDK clients) always pass.
fn validate_origin(headers: &HeaderMap, state: &AppState) -> Option<Response> {
    if !state.validate_origin {
        return None;
    }
    let Some(origin) = headers.get(header::ORIGIN) else {
        return None;
    };
    let origin = origin.to_str().unwrap_or("");

    let local = LOCAL_ORIGIN_PREFIXES
        .iter()
        .any(|prefix| origin.starts_with(prefix));
    let listed = state
        .allowed_origins
        .iter()
        .any(|o| o == origin || o == "*");
    if local || listed {
        return None;
    }

    tracing::warn!(origin = %origin, "Rejected request from disallowed origin");
    Some((StatusCode::FORBIDDEN, "Origin not allowed").into_response())
}

/// Session id from the header, falling back to query parameters.
fn extract_session_id(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(id) = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return Some(id.to_string());
    }
    SESSION_QUERY_KEYS
        .iter()
        .find_map(|key| query.get(*key))
        .filter(|s| !s.is_empty())
        .cloned()
}

/// Protocol version from the header. Absent means a pre-header client; the
/// version is advisory and never gates dispatch.
fn extract_protocol_version(headers: &HeaderMap) -> String {
    headers
        .get(MCP_PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL_VERSION)
        .to_string()
}

fn json_rpc_error_response(error: JsonRpcError) -> Response {
    axum::Json(crate::protocol::JsonRpcResponse::error(None, error)).into_response()
}

/// POST: one JSON-RPC message per request body. A message with an `id` is a
/// request and gets a response body; one without is a notification and gets
/// 202 Accepted.
async fn handle_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Some(resp) = validate_origin(&headers, &state) {
        return resp;
    }

    let session_id = extract_session_id(&headers, &query);
    let protocol_version = extract_protocol_version(&headers);

    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return json_rpc_error_response(JsonRpcError::parse_error(format!(
                "Invalid JSON: {}",
                e
            )));
        }
    };
    if !parsed.is_object() {
        return json_rpc_error_response(JsonRpcError::invalid_request(
            "Expected a JSON-RPC message object",
        ));
    }

    if parsed.get("id").is_none() {
        match serde_json::from_value::<JsonRpcNotification>(parsed) {
            Ok(notification) => {
                state
                    .engine
                    .handle_notification(notification, session_id.as_deref(), &protocol_version)
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed notification");
            }
        }
        return StatusCode::ACCEPTED.into_response();
    }

    let request: JsonRpcRequest = match serde_json::from_value(parsed) {
        Ok(r) => r,
        Err(e) => {
            return json_rpc_error_response(JsonRpcError::invalid_request(format!(
                "Invalid request: {}",
                e
            )));
        }
    };

    let (response, new_session_id) = state
        .engine
        .handle_request(request, session_id.as_deref(), &protocol_version)
        .await;

    let mut resp = axum::Json(response).into_response();
    if let Some(id) = new_session_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            resp.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
    }
    resp
}

/// GET: attach the SSE push stream for a session.
async fn handle_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = validate_origin(&headers, &state) {
        return resp;
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains("text/event-stream") && !accept.contains("*/*") && !accept.is_empty() {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Accept header must include text/event-stream",
        )
            .into_response();
    }

    let Some(session_id) = extract_session_id(&headers, &query) else {
        return (StatusCode::BAD_REQUEST, "Missing session id").into_response();
    };
    let Some(session) = state.engine.sessions().get(&session_id) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    tracing::info!(session_id = %session_id, "Client attached push stream");

    let stream = state
        .engine
        .hub()
        .attach(&session)
        .map(|push| Ok::<_, Infallible>(Event::default().event(push.event).data(push.data)));

    // Heartbeats are explicit events on the stream, so no axum keep-alive.
    Sse::new(stream).into_response()
}

/// DELETE: explicit session teardown. Idempotent at the store level; a
/// repeat delete reports 404.
async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = validate_origin(&headers, &state) {
        return resp;
    }

    let Some(session_id) = extract_session_id(&headers, &query) else {
        return (StatusCode::BAD_REQUEST, "Missing session id").into_response();
    };

    if state.engine.sessions().remove(&session_id) {
        tracing::info!(session_id = %session_id, "Session terminated by client");
        (StatusCode::OK, "Session terminated").into_response()
    } else {
        (StatusCode::NOT_FOUND, "Session not found").into_response()
    }
}

/// OPTIONS: preflight. The CORS layer adds the actual headers.
async fn handle_options() -> StatusCode {
    StatusCode::OK
}
