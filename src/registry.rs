//! Capability registry: commands, tools, and notification handlers
//!
//! Three disjoint namespaces map method/tool/notification names to handlers.
//! Registration happens through a [`RegistryBuilder`] holding a static table of
//! (name, factory) pairs; [`RegistryBuilder::build`] runs every factory, logging
//! and skipping any single one that fails, so one bad handler never aborts
//! registry construction. Lookup is by exact, case-sensitive name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;

use crate::dispatch::HandlerContext;
use crate::error::Result;
use crate::protocol::{CallToolResult, JsonRpcNotification, JsonRpcRequest, ToolDescriptor};

/// A request/response method handler (`initialize`, `ping`, `tools/list`, ...).
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(
        &self,
        request: &JsonRpcRequest,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandOutcome>;
}

/// Result of a command execution: the JSON-RPC result value, plus the session
/// id minted by `initialize` so the transport can set the `Mcp-Session-Id`
/// response header without any out-of-band state.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub result: Value,
    pub new_session_id: Option<String>,
}

impl CommandOutcome {
    pub fn of<T: Serialize>(result: &T) -> Result<Self> {
        Ok(Self {
            result: serde_json::to_value(result)?,
            new_session_id: None,
        })
    }

    pub fn from_value(result: Value) -> Self {
        Self {
            result,
            new_session_id: None,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.new_session_id = Some(id.into());
        self
    }
}

/// A named, schema-described, asynchronous operation invoked exclusively
/// through `tools/call`. The engine never interprets what a tool does; it only
/// carries the descriptor and the structured result back and forth.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(&self, arguments: Value, session_id: Option<&str>) -> Result<CallToolResult>;
}

/// A fire-and-forget inbound message handler (`notifications/initialized`, ...).
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(
        &self,
        notification: &JsonRpcNotification,
        ctx: &HandlerContext<'_>,
    ) -> Result<()>;
}

/// Build a JSON schema document for a tool's input or output type.
pub fn schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_default()
}

type CommandFactory = Box<dyn Fn() -> Result<Arc<dyn Command>> + Send + Sync>;
type ToolFactory = Box<dyn Fn() -> Result<Arc<dyn ToolHandler>> + Send + Sync>;
type NotificationFactory = Box<dyn Fn() -> Result<Arc<dyn NotificationHandler>> + Send + Sync>;

/// Registration table populated at process start (or re-initialization).
#[derive(Default)]
pub struct RegistryBuilder {
    commands: Vec<(String, CommandFactory)>,
    tools: Vec<(String, ToolFactory)>,
    notifications: Vec<(String, NotificationFactory)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command factory. A later entry with the same name replaces
    /// an earlier one at build time.
    pub fn command<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Command>> + Send + Sync + 'static,
    {
        self.commands.push((name.into(), Box::new(factory)));
        self
    }

    pub fn tool<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ToolHandler>> + Send + Sync + 'static,
    {
        self.tools.push((name.into(), Box::new(factory)));
        self
    }

    pub fn notification<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn NotificationHandler>> + Send + Sync + 'static,
    {
        self.notifications.push((name.into(), Box::new(factory)));
        self
    }

    /// Convenience for registering an already-constructed tool under its own
    /// descriptor name.
    pub fn tool_instance(self, tool: Arc<dyn ToolHandler>) -> Self {
        let name = tool.descriptor().name;
        self.tool(name, move || Ok(tool.clone()))
    }

    /// Run every factory and assemble the registry. A failing factory is
    /// logged and that single handler is skipped.
    pub fn build(&self) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::default();

        for (name, factory) in &self.commands {
            match factory() {
                Ok(command) => {
                    registry.commands.insert(name.clone(), command);
                    tracing::debug!(command = %name, "Registered command");
                }
                Err(e) => {
                    tracing::error!(command = %name, error = %e, "Failed to construct command");
                }
            }
        }

        for (name, factory) in &self.tools {
            match factory() {
                Ok(tool) => {
                    if registry.tools.insert(name.clone(), tool).is_none() {
                        registry.tool_order.push(name.clone());
                    }
                    tracing::debug!(tool = %name, "Registered tool");
                }
                Err(e) => {
                    tracing::error!(tool = %name, error = %e, "Failed to construct tool");
                }
            }
        }

        for (name, factory) in &self.notifications {
            match factory() {
                Ok(handler) => {
                    registry.notifications.insert(name.clone(), handler);
                    tracing::debug!(notification = %name, "Registered notification handler");
                }
                Err(e) => {
                    tracing::error!(
                        notification = %name,
                        error = %e,
                        "Failed to construct notification handler"
                    );
                }
            }
        }

        tracing::info!(
            commands = registry.commands.len(),
            tools = registry.tools.len(),
            notifications = registry.notifications.len(),
            "Capability registry initialized"
        );
        registry
    }
}

/// Immutable handler table built from a [`RegistryBuilder`].
///
/// Re-initialization swaps in a freshly built registry; doing so concurrently
/// with live dispatch is the caller's responsibility to avoid.
#[derive(Default)]
pub struct CapabilityRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    /// Tool names in registration order, for `tools/list`
    tool_order: Vec<String>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
}

impl CapabilityRegistry {
    pub fn lookup_command(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    pub fn lookup_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn lookup_notification(&self, name: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications.get(name).cloned()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn has_notification(&self, name: &str) -> bool {
        self.notifications.contains_key(name)
    }

    /// Tool descriptors in registration order.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tool_order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor())
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("commands", &self.commands.len())
            .field("tools", &self.tools.len())
            .field("notifications", &self.notifications.len())
            .finish()
    }
}
