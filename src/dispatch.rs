//! Request and notification dispatch
//!
//! The [`ProtocolEngine`] is the transport-independent core: it owns the
//! session store, the notification hub, and the capability registry, and it
//! turns inbound JSON-RPC messages into responses. Transports hand it parsed
//! envelopes plus the session id and protocol version they extracted, and get
//! back a response (for requests) or nothing (for notifications).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::builtin;
use crate::error::{Error, JsonRpcError};
use crate::notify::{NotificationHub, DEFAULT_HEARTBEAT_INTERVAL};
use crate::protocol::{
    methods, Implementation, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ServerCapabilities,
};
use crate::registry::{CapabilityRegistry, RegistryBuilder};
use crate::session::SessionStore;

/// Per-dispatch context handed to command and notification handlers.
pub struct HandlerContext<'a> {
    engine: &'a ProtocolEngine,
    session_id: Option<&'a str>,
    protocol_version: &'a str,
}

impl<'a> HandlerContext<'a> {
    /// Session id extracted by the transport, if the client supplied one.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id
    }

    /// Negotiated or header-derived protocol version for this exchange.
    pub fn protocol_version(&self) -> &str {
        self.protocol_version
    }

    pub fn sessions(&self) -> &SessionStore {
        self.engine.sessions()
    }

    pub fn hub(&self) -> &NotificationHub {
        self.engine.hub()
    }

    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        self.engine.registry()
    }

    pub fn server_info(&self) -> &Implementation {
        &self.engine.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.engine.capabilities
    }

    pub fn instructions(&self) -> Option<&str> {
        self.engine.instructions.as_deref()
    }

    pub fn append_structured_content(&self) -> bool {
        self.engine.append_structured_content
    }
}

/// The protocol core shared by every transport connection.
pub struct ProtocolEngine {
    sessions: Arc<SessionStore>,
    hub: NotificationHub,
    registry: RwLock<Arc<CapabilityRegistry>>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    append_structured_content: bool,
}

impl ProtocolEngine {
    pub fn builder() -> ProtocolEngineBuilder {
        ProtocolEngineBuilder::new()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sessions_arc(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// Snapshot of the current handler table.
    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        self.registry.read().unwrap().clone()
    }

    /// Swap in a freshly built registry. In-flight dispatches keep the
    /// snapshot they already took.
    pub fn replace_registry(&self, builder: &RegistryBuilder) {
        let rebuilt = Arc::new(builder.build());
        *self.registry.write().unwrap() = rebuilt;
        tracing::info!("Capability registry replaced");
    }

    /// Dispatch one request. Returns the response plus the session id minted
    /// by `initialize`, which the transport surfaces as a response header.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        session_id: Option<&str>,
        protocol_version: &str,
    ) -> (JsonRpcResponse, Option<String>) {
        let id = request.id.clone();

        if let Err(e) = request.validate() {
            return (JsonRpcResponse::error(Some(id), e), None);
        }

        // Lifecycle gate: once a client presents a session id, everything
        // except the handshake itself and ping requires a Ready session.
        // An unknown session id counts as not initialized.
        if gate_applies(&request.method) {
            if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
                if !self.sessions.is_initialized(sid) {
                    tracing::warn!(
                        session_id = %sid,
                        method = %request.method,
                        "Rejected request before handshake completed"
                    );
                    return (
                        JsonRpcResponse::error(Some(id), JsonRpcError::not_initialized()),
                        None,
                    );
                }
            }
        }

        let command = match self.registry().lookup_command(&request.method) {
            Some(command) => command,
            None => {
                tracing::debug!(method = %request.method, "Method not found");
                return (
                    JsonRpcResponse::error(Some(id), JsonRpcError::method_not_found(&request.method)),
                    None,
                );
            }
        };

        let ctx = HandlerContext {
            engine: self,
            session_id,
            protocol_version,
        };
        match command.execute(&request, &ctx).await {
            Ok(outcome) => (
                JsonRpcResponse::result(id, outcome.result),
                outcome.new_session_id,
            ),
            Err(Error::JsonRpc(e)) => (JsonRpcResponse::error(Some(id), e), None),
            Err(e) => {
                tracing::error!(method = %request.method, error = %e, "Command failed");
                (
                    JsonRpcResponse::error(Some(id), JsonRpcError::internal_error(e.to_string())),
                    None,
                )
            }
        }
    }

    /// Dispatch one inbound notification. Never produces a response: an
    /// unmatched method or a failing handler is logged and swallowed.
    pub async fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        session_id: Option<&str>,
        protocol_version: &str,
    ) {
        let handler = match self.registry().lookup_notification(&notification.method) {
            Some(handler) => handler,
            None => {
                tracing::warn!(method = %notification.method, "Unhandled notification");
                return;
            }
        };

        let ctx = HandlerContext {
            engine: self,
            session_id,
            protocol_version,
        };
        if let Err(e) = handler.handle(&notification, &ctx).await {
            tracing::error!(
                method = %notification.method,
                error = %e,
                "Notification handler failed"
            );
        }
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("sessions", &self.sessions.len())
            .field("server_info", &self.server_info)
            .finish()
    }
}

/// Methods exempt from the initialization gate: the handshake itself, and
/// ping so liveness checks work at any lifecycle stage.
fn gate_applies(method: &str) -> bool {
    method != methods::INITIALIZE && method != methods::PING
}

/// Builder for a [`ProtocolEngine`]. Protocol commands and notification
/// handlers are pre-registered; application tools and overrides layer on top.
pub struct ProtocolEngineBuilder {
    registry: RegistryBuilder,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    append_structured_content: bool,
    heartbeat_interval: Duration,
}

impl ProtocolEngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: builtin::protocol_registry(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            capabilities: ServerCapabilities::default_set(),
            instructions: None,
            append_structured_content: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_info = Implementation {
            name: name.into(),
            version: version.into(),
            title: None,
        };
        self
    }

    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// When enabled, a tool result's `structuredContent` is also appended to
    /// `content` as serialized text, for clients that only read text blocks.
    pub fn append_structured_content(mut self, enabled: bool) -> Self {
        self.append_structured_content = enabled;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn tool<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> crate::error::Result<Arc<dyn crate::registry::ToolHandler>>
            + Send
            + Sync
            + 'static,
    {
        self.registry = self.registry.tool(name, factory);
        self
    }

    pub fn tool_instance(mut self, tool: Arc<dyn crate::registry::ToolHandler>) -> Self {
        self.registry = self.registry.tool_instance(tool);
        self
    }

    pub fn command<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> crate::error::Result<Arc<dyn crate::registry::Command>> + Send + Sync + 'static,
    {
        self.registry = self.registry.command(name, factory);
        self
    }

    pub fn notification<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> crate::error::Result<Arc<dyn crate::registry::NotificationHandler>>
            + Send
            + Sync
            + 'static,
    {
        self.registry = self.registry.notification(name, factory);
        self
    }

    pub fn build(self) -> ProtocolEngine {
        let sessions = Arc::new(SessionStore::new());
        let hub =
            NotificationHub::new(sessions.clone()).with_heartbeat_interval(self.heartbeat_interval);
        ProtocolEngine {
            sessions,
            hub,
            registry: RwLock::new(Arc::new(self.registry.build())),
            server_info: self.server_info,
            capabilities: self.capabilities,
            instructions: self.instructions,
            append_structured_content: self.append_structured_content,
        }
    }
}

impl Default for ProtocolEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::protocol::RequestId;
    use crate::registry::{Command, CommandOutcome};

    fn engine() -> ProtocolEngine {
        ProtocolEngine::builder().build()
    }

    fn error_of(response: &JsonRpcResponse) -> &JsonRpcError {
        match response {
            JsonRpcResponse::Error(e) => &e.error,
            JsonRpcResponse::Result(_) => panic!("expected error response"),
        }
    }

    fn result_of(response: &JsonRpcResponse) -> &serde_json::Value {
        match response {
            JsonRpcResponse::Result(r) => &r.result,
            JsonRpcResponse::Error(e) => panic!("expected result, got {:?}", e.error),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_carries_name_in_data() {
        let engine = engine();
        let request = JsonRpcRequest::new(1, "no/such/method");
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;

        let error = error_of(&response);
        assert_eq!(error.code, -32601);
        assert_eq!(error.data, Some(json!("no/such/method")));
    }

    #[tokio::test]
    async fn test_invalid_jsonrpc_version_rejected() {
        let engine = engine();
        let mut request = JsonRpcRequest::new(1, "ping");
        request.jsonrpc = "1.0".to_string();
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        assert_eq!(error_of(&response).code, -32600);
    }

    #[tokio::test]
    async fn test_gate_blocks_uninitialized_session() {
        let engine = engine();
        engine.sessions().create("s1").unwrap();

        let request = JsonRpcRequest::new(1, "tools/list");
        let (response, _) = engine
            .handle_request(request, Some("s1"), "2025-06-18")
            .await;
        let error = error_of(&response);
        assert_eq!(error.code, -32002);
        assert_eq!(error.message, "Server not initialized");
    }

    #[tokio::test]
    async fn test_gate_treats_unknown_session_as_uninitialized() {
        let engine = engine();
        let request = JsonRpcRequest::new(1, "tools/list");
        let (response, _) = engine
            .handle_request(request, Some("ghost"), "2025-06-18")
            .await;
        assert_eq!(error_of(&response).code, -32002);
    }

    #[tokio::test]
    async fn test_gate_short_circuits_before_handler() {
        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl Command for Counting {
            async fn execute(
                &self,
                _request: &JsonRpcRequest,
                _ctx: &HandlerContext<'_>,
            ) -> crate::error::Result<CommandOutcome> {
                self.0.fetch_add(1, Ordering::SeqCst);
                CommandOutcome::of(&json!({"ok": true}))
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine = ProtocolEngine::builder()
            .command("scene/info", move || {
                Ok(Arc::new(Counting(counter.clone())) as Arc<dyn Command>)
            })
            .build();
        engine.sessions().create("s1").unwrap();

        // Before the handshake completes the handler must never run.
        let (response, _) = engine
            .handle_request(JsonRpcRequest::new(1, "scene/info"), Some("s1"), "2025-06-18")
            .await;
        assert_eq!(error_of(&response).code, -32002);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        engine.sessions().mark_initialized("s1");
        let (response, _) = engine
            .handle_request(JsonRpcRequest::new(2, "scene/info"), Some("s1"), "2025-06-18")
            .await;
        assert_eq!(result_of(&response), &json!({"ok": true}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ping_bypasses_gate() {
        let engine = engine();
        engine.sessions().create("s1").unwrap();

        let request = JsonRpcRequest::new(1, "ping");
        let (response, _) = engine
            .handle_request(request, Some("s1"), "2025-06-18")
            .await;
        assert_eq!(result_of(&response), &json!({}));
    }

    #[tokio::test]
    async fn test_gate_skipped_without_session_id() {
        let engine = engine();
        let request = JsonRpcRequest::new(1, "tools/list");
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_internal_error() {
        struct Failing;

        #[async_trait]
        impl Command for Failing {
            async fn execute(
                &self,
                _request: &JsonRpcRequest,
                _ctx: &HandlerContext<'_>,
            ) -> crate::error::Result<CommandOutcome> {
                Err(crate::error::Error::handler("backend went away"))
            }
        }

        let engine = ProtocolEngine::builder()
            .command("fail", || Ok(Arc::new(Failing) as Arc<dyn Command>))
            .build();
        engine.sessions().create("s1").unwrap();
        engine.sessions().mark_initialized("s1");

        let request = JsonRpcRequest::new(1, "fail");
        let (response, _) = engine
            .handle_request(request, Some("s1"), "2025-06-18")
            .await;
        let error = error_of(&response);
        assert_eq!(error.code, -32603);
        assert_eq!(error.message, "Internal error");
        assert!(error
            .data
            .as_ref()
            .and_then(|d| d.as_str())
            .is_some_and(|d| d.contains("backend went away")));
    }

    #[tokio::test]
    async fn test_unhandled_notification_is_silent() {
        let engine = engine();
        let notification = JsonRpcNotification::new("notifications/unknown");
        engine
            .handle_notification(notification, None, "2025-06-18")
            .await;
    }

    #[tokio::test]
    async fn test_response_id_echoes_request_id() {
        let engine = engine();
        let request = JsonRpcRequest::new("req-7", "ping");
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        match response {
            JsonRpcResponse::Result(r) => assert_eq!(r.id, RequestId::String("req-7".into())),
            JsonRpcResponse::Error(_) => panic!("expected result"),
        }
    }

    #[tokio::test]
    async fn test_replace_registry_swaps_handlers() {
        let engine = engine();
        assert!(engine.registry().has_command("ping"));

        let bare = RegistryBuilder::new();
        engine.replace_registry(&bare);
        assert!(!engine.registry().has_command("ping"));
    }
}
