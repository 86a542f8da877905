//! # streamable-mcp
//!
//! Streamable HTTP server engine for the Model Context Protocol (MCP).
//!
//! The crate splits the server into a transport-independent protocol core and
//! a thin HTTP adapter:
//!
//! - [`ProtocolEngine`] owns sessions, capability dispatch, and notification
//!   delivery. It consumes parsed JSON-RPC envelopes and knows nothing about
//!   HTTP.
//! - [`HttpTransport`] maps the engine onto a single streamable HTTP endpoint:
//!   POST for requests and notifications, GET for the SSE push stream, DELETE
//!   for session teardown.
//!
//! ## Lifecycle
//!
//! A session is minted by `initialize` and identified by the `MCP-Session-Id`
//! header from then on. It stays Pending until the client follows up with
//! `notifications/initialized`; until that happens every request except the
//! handshake and `ping` is rejected with `-32002`. Server-to-client
//! notifications queue per session while no push stream is attached and are
//! drained, in order, the moment one connects.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use streamable_mcp::{
//!     CallToolResult, HttpTransport, ProtocolEngine, Result, ToolDescriptor, ToolHandler,
//! };
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl ToolHandler for Greet {
//!     fn descriptor(&self) -> ToolDescriptor {
//!         ToolDescriptor {
//!             name: "greet".into(),
//!             title: None,
//!             description: Some("Greet someone by name".into()),
//!             input_schema: json!({
//!                 "type": "object",
//!                 "properties": {"name": {"type": "string"}},
//!                 "required": ["name"]
//!             }),
//!             output_schema: None,
//!         }
//!     }
//!
//!     async fn execute(&self, arguments: Value, _session: Option<&str>) -> Result<CallToolResult> {
//!         let name = arguments["name"].as_str().unwrap_or("world");
//!         Ok(CallToolResult::text(format!("Hello, {name}!")))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = ProtocolEngine::builder()
//!         .server_info("greeter", "1.0.0")
//!         .tool_instance(Arc::new(Greet))
//!         .build();
//!
//!     HttpTransport::new(engine).serve("127.0.0.1:3000").await
//! }
//! ```

mod builtin;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use dispatch::{HandlerContext, ProtocolEngine, ProtocolEngineBuilder};
pub use error::{Error, ErrorCode, JsonRpcError, Result};
pub use notify::{NotificationHub, SessionEventStream, DEFAULT_HEARTBEAT_INTERVAL};
pub use protocol::{
    CallToolParams, CallToolResult, Content, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    LogLevel, ReadResourceParams, ReadResourceResult, RequestId, Resource, ResourceContents,
    ServerCapabilities, ToolDescriptor, DEFAULT_PROTOCOL_VERSION, LATEST_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
pub use registry::{
    schema_for, CapabilityRegistry, Command, CommandOutcome, NotificationHandler, RegistryBuilder,
    ToolHandler,
};
pub use session::{PushEvent, Session, SessionStore, DEFAULT_SESSION_MAX_AGE};
pub use transport::HttpTransport;
