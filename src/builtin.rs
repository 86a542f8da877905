//! Built-in protocol commands and notification handlers
//!
//! These cover the MCP handshake and the generic surface every server carries:
//! `initialize`, `ping`, `tools/list`, `tools/call`, `logging/setLevel`, and
//! the client notifications `initialized`, `cancelled`, and `progress`.
//! Everything else is supplied by the application through the registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::dispatch::HandlerContext;
use crate::error::{Error, Result};
use crate::protocol::{
    methods, CallToolParams, CallToolResult, Content, EmptyResult, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult, SetLogLevelParams,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::registry::{Command, CommandOutcome, NotificationHandler, RegistryBuilder};

/// Registry pre-populated with the protocol's built-in handlers.
pub(crate) fn protocol_registry() -> RegistryBuilder {
    RegistryBuilder::new()
        .command(methods::INITIALIZE, || {
            Ok(Arc::new(InitializeCommand) as Arc<dyn Command>)
        })
        .command(methods::PING, || Ok(Arc::new(PingCommand) as Arc<dyn Command>))
        .command(methods::TOOLS_LIST, || {
            Ok(Arc::new(ListToolsCommand) as Arc<dyn Command>)
        })
        .command(methods::TOOLS_CALL, || {
            Ok(Arc::new(CallToolCommand) as Arc<dyn Command>)
        })
        .command(methods::LOGGING_SET_LEVEL, || {
            Ok(Arc::new(SetLogLevelCommand) as Arc<dyn Command>)
        })
        .notification(crate::protocol::notifications::INITIALIZED, || {
            Ok(Arc::new(InitializedHandler) as Arc<dyn NotificationHandler>)
        })
        .notification(crate::protocol::notifications::CANCELLED, || {
            Ok(Arc::new(CancelledHandler) as Arc<dyn NotificationHandler>)
        })
        .notification(crate::protocol::notifications::PROGRESS, || {
            Ok(Arc::new(ProgressHandler) as Arc<dyn NotificationHandler>)
        })
}

/// `initialize`: negotiate a protocol version, mint a session, and describe
/// the server. The new session starts Pending until the client follows up
/// with `notifications/initialized`.
struct InitializeCommand;

#[async_trait]
impl Command for InitializeCommand {
    async fn execute(
        &self,
        request: &JsonRpcRequest,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandOutcome> {
        // First contact from an unknown client must not fail on odd params.
        let params: InitializeParams = request.parse_params().unwrap_or_default();

        let negotiated = match params.protocol_version.as_deref() {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v.to_string(),
            Some(v) => {
                tracing::warn!(
                    requested = %v,
                    fallback = %LATEST_PROTOCOL_VERSION,
                    "Unsupported protocol version requested"
                );
                LATEST_PROTOCOL_VERSION.to_string()
            }
            None => LATEST_PROTOCOL_VERSION.to_string(),
        };

        let session_id = Uuid::new_v4().to_string();
        ctx.sessions().create(&session_id)?;

        if let Some(client) = &params.client_info {
            tracing::info!(
                session_id = %session_id,
                client = %client.name,
                client_version = %client.version,
                protocol_version = %negotiated,
                "Client initializing"
            );
        } else {
            tracing::info!(
                session_id = %session_id,
                protocol_version = %negotiated,
                "Client initializing"
            );
        }

        let result = InitializeResult {
            protocol_version: negotiated,
            capabilities: ctx.capabilities().clone(),
            server_info: ctx.server_info().clone(),
            instructions: ctx.instructions().map(str::to_string),
        };
        Ok(CommandOutcome::of(&result)?.with_session_id(session_id))
    }
}

/// `ping`: liveness check, exempt from the initialization gate.
struct PingCommand;

#[async_trait]
impl Command for PingCommand {
    async fn execute(
        &self,
        _request: &JsonRpcRequest,
        _ctx: &HandlerContext<'_>,
    ) -> Result<CommandOutcome> {
        CommandOutcome::of(&EmptyResult::default())
    }
}

/// `tools/list`: descriptors in registration order.
struct ListToolsCommand;

#[async_trait]
impl Command for ListToolsCommand {
    async fn execute(
        &self,
        _request: &JsonRpcRequest,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandOutcome> {
        let result = ListToolsResult {
            tools: ctx.registry().list_tools(),
        };
        CommandOutcome::of(&result)
    }
}

/// `tools/call`: resolve the tool and run it. Tool-level failures (unknown
/// name, bad params, handler error) are reported as `isError` results, never
/// as JSON-RPC errors.
struct CallToolCommand;

#[async_trait]
impl Command for CallToolCommand {
    async fn execute(
        &self,
        request: &JsonRpcRequest,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandOutcome> {
        if request.params.is_none() {
            return error_result("No parameters provided");
        }
        let params: CallToolParams = match request.parse_params() {
            Ok(params) => params,
            Err(e) => return error_result(format!("Invalid parameters: {}", e.message)),
        };

        let Some(tool) = ctx.registry().lookup_tool(&params.name) else {
            tracing::debug!(tool = %params.name, "Unknown tool called");
            return error_result(format!("Unknown tool: {}", params.name));
        };

        let arguments = params
            .arguments
            .unwrap_or_else(|| Value::Object(Default::default()));
        let mut result = match tool.execute(arguments, ctx.session_id()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %params.name, error = %e, "Tool execution failed");
                CallToolResult::error(format!("Tool execution error: {e}"))
            }
        };

        if ctx.append_structured_content() {
            if let Some(structured) = &result.structured_content {
                result.content.push(Content::text(structured.to_string()));
            }
        }
        CommandOutcome::of(&result)
    }
}

fn error_result(message: impl Into<String>) -> Result<CommandOutcome> {
    CommandOutcome::of(&CallToolResult::error(message))
}

/// `logging/setLevel`: record the requested minimum level on the session.
struct SetLogLevelCommand;

#[async_trait]
impl Command for SetLogLevelCommand {
    async fn execute(
        &self,
        request: &JsonRpcRequest,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandOutcome> {
        let params: SetLogLevelParams = request.parse_params().map_err(Error::from)?;

        match ctx.session_id().and_then(|sid| ctx.sessions().get(sid)) {
            Some(session) => {
                session.set_log_level(params.level);
                tracing::info!(
                    session_id = %session.id(),
                    level = ?params.level,
                    "Log level set"
                );
            }
            None => {
                tracing::warn!(level = ?params.level, "setLevel without a known session");
            }
        }
        CommandOutcome::of(&EmptyResult::default())
    }
}

/// `notifications/initialized`: completes the handshake, Pending -> Ready.
struct InitializedHandler;

#[async_trait]
impl NotificationHandler for InitializedHandler {
    async fn handle(
        &self,
        _notification: &JsonRpcNotification,
        ctx: &HandlerContext<'_>,
    ) -> Result<()> {
        match ctx.session_id().filter(|s| !s.is_empty()) {
            Some(sid) => {
                ctx.sessions().mark_initialized(sid);
            }
            None => {
                tracing::warn!("Initialized notification without a session id");
            }
        }
        Ok(())
    }
}

/// `notifications/cancelled`: logged only; in-flight work is not interrupted.
struct CancelledHandler;

#[async_trait]
impl NotificationHandler for CancelledHandler {
    async fn handle(
        &self,
        notification: &JsonRpcNotification,
        _ctx: &HandlerContext<'_>,
    ) -> Result<()> {
        let params = notification.params.as_ref();
        let request_id = params.and_then(|p| p.get("requestId")).cloned();
        let reason = params
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("unspecified");
        tracing::info!(request_id = ?request_id, reason = %reason, "Request cancelled by client");
        Ok(())
    }
}

/// `notifications/progress` from the client: logged at debug.
struct ProgressHandler;

#[async_trait]
impl NotificationHandler for ProgressHandler {
    async fn handle(
        &self,
        notification: &JsonRpcNotification,
        _ctx: &HandlerContext<'_>,
    ) -> Result<()> {
        tracing::debug!(params = ?notification.params, "Progress notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::dispatch::ProtocolEngine;
    use crate::protocol::{notifications, JsonRpcResponse, LogLevel, ToolDescriptor};
    use crate::registry::ToolHandler;

    fn engine() -> ProtocolEngine {
        ProtocolEngine::builder()
            .server_info("test-server", "0.0.1")
            .build()
    }

    fn result_of(response: &JsonRpcResponse) -> &Value {
        match response {
            JsonRpcResponse::Result(r) => &r.result,
            JsonRpcResponse::Error(e) => panic!("expected result, got {:?}", e.error),
        }
    }

    async fn initialize(engine: &ProtocolEngine, params: Value) -> (Value, String) {
        let request = JsonRpcRequest::new(1, methods::INITIALIZE).with_params(params);
        let (response, session_id) = engine.handle_request(request, None, "2025-06-18").await;
        (
            result_of(&response).clone(),
            session_id.expect("initialize must mint a session id"),
        )
    }

    struct UppercaseTool;

    #[async_trait]
    impl ToolHandler for UppercaseTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "uppercase".to_string(),
                title: None,
                description: Some("Uppercase a string".to_string()),
                input_schema: json!({"type": "object"}),
                output_schema: None,
            }
        }

        async fn execute(&self, arguments: Value, _: Option<&str>) -> Result<CallToolResult> {
            let text = arguments
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::handler("missing 'text' argument"))?;
            Ok(CallToolResult::text(text.to_uppercase())
                .with_structured(json!({ "length": text.len() })))
        }
    }

    #[tokio::test]
    async fn test_initialize_echoes_supported_version() {
        let engine = engine();
        let (result, _) = initialize(
            &engine,
            json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": {"name": "client", "version": "1.0"}
            }),
        )
        .await;
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_latest_on_unsupported_version() {
        let engine = engine();
        let (result, _) = initialize(&engine, json!({"protocolVersion": "1999-01-01"})).await;
        assert_eq!(result["protocolVersion"], LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_initialize_tolerates_empty_params() {
        let engine = engine();
        let request = JsonRpcRequest::new(1, methods::INITIALIZE);
        let (response, session_id) = engine.handle_request(request, None, "2025-06-18").await;
        assert!(!response.is_error());
        assert!(session_id.is_some());
    }

    #[tokio::test]
    async fn test_each_initialize_mints_a_distinct_session() {
        let engine = engine();
        let (_, first) = initialize(&engine, json!({})).await;
        let (_, second) = initialize(&engine, json!({})).await;
        assert_ne!(first, second);
        assert_eq!(engine.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_initialized_notification_completes_handshake() {
        let engine = engine();
        let (_, session_id) = initialize(&engine, json!({})).await;
        assert!(!engine.sessions().is_initialized(&session_id));

        engine
            .handle_notification(
                JsonRpcNotification::new(notifications::INITIALIZED),
                Some(&session_id),
                "2025-06-18",
            )
            .await;
        assert!(engine.sessions().is_initialized(&session_id));
    }

    #[tokio::test]
    async fn test_tools_list_includes_registered_tool() {
        let engine = ProtocolEngine::builder()
            .tool_instance(Arc::new(UppercaseTool))
            .build();

        let request = JsonRpcRequest::new(1, methods::TOOLS_LIST);
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        let result = result_of(&response);
        assert_eq!(result["tools"][0]["name"], "uppercase");
        assert!(result["tools"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_call_tool_success() {
        let engine = ProtocolEngine::builder()
            .tool_instance(Arc::new(UppercaseTool))
            .build();

        let request = JsonRpcRequest::new(1, methods::TOOLS_CALL)
            .with_params(json!({"name": "uppercase", "arguments": {"text": "hi"}}));
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        let result = result_of(&response);
        assert_eq!(result["content"][0]["text"], "HI");
        assert!(result.get("isError").is_none());
        assert_eq!(result["structuredContent"]["length"], 2);
    }

    #[tokio::test]
    async fn test_call_unknown_tool_is_tool_level_error() {
        let engine = engine();
        let request =
            JsonRpcRequest::new(1, methods::TOOLS_CALL).with_params(json!({"name": "nope"}));
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;

        // Tool-level failure, not a JSON-RPC error.
        let result = result_of(&response);
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_call_tool_without_params_is_tool_level_error() {
        let engine = engine();
        let request = JsonRpcRequest::new(1, methods::TOOLS_CALL);
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        let result = result_of(&response);
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "No parameters provided");
    }

    #[tokio::test]
    async fn test_failing_tool_reports_execution_error() {
        let engine = ProtocolEngine::builder()
            .tool_instance(Arc::new(UppercaseTool))
            .build();

        let request = JsonRpcRequest::new(1, methods::TOOLS_CALL)
            .with_params(json!({"name": "uppercase", "arguments": {}}));
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        let result = result_of(&response);
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Tool execution error:"));
        assert!(text.contains("missing 'text' argument"));
    }

    #[tokio::test]
    async fn test_structured_content_appended_when_enabled() {
        let engine = ProtocolEngine::builder()
            .tool_instance(Arc::new(UppercaseTool))
            .append_structured_content(true)
            .build();

        let request = JsonRpcRequest::new(1, methods::TOOLS_CALL)
            .with_params(json!({"name": "uppercase", "arguments": {"text": "ab"}}));
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        let result = result_of(&response);
        assert_eq!(result["content"].as_array().unwrap().len(), 2);
        assert!(result["content"][1]["text"]
            .as_str()
            .unwrap()
            .contains("\"length\":2"));
    }

    #[tokio::test]
    async fn test_set_log_level_updates_session() {
        let engine = engine();
        let (_, session_id) = initialize(&engine, json!({})).await;
        engine.sessions().mark_initialized(&session_id);

        let request = JsonRpcRequest::new(2, methods::LOGGING_SET_LEVEL)
            .with_params(json!({"level": "warning"}));
        let (response, _) = engine
            .handle_request(request, Some(&session_id), "2025-06-18")
            .await;
        assert!(!response.is_error());

        let session = engine.sessions().get(&session_id).unwrap();
        assert_eq!(session.log_level(), LogLevel::Warning);
    }

    #[tokio::test]
    async fn test_set_log_level_rejects_bad_level() {
        let engine = engine();
        let request = JsonRpcRequest::new(1, methods::LOGGING_SET_LEVEL)
            .with_params(json!({"level": "verbose"}));
        let (response, _) = engine.handle_request(request, None, "2025-06-18").await;
        match response {
            JsonRpcResponse::Error(e) => assert_eq!(e.error.code, -32602),
            JsonRpcResponse::Result(_) => panic!("expected invalid params error"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_notification_is_acknowledged_silently() {
        let engine = engine();
        engine
            .handle_notification(
                JsonRpcNotification::new(notifications::CANCELLED)
                    .with_params(json!({"requestId": 9, "reason": "user abort"})),
                None,
                "2025-06-18",
            )
            .await;
    }
}
