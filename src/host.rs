//! Host tool framework interface.
//!
//! The proxy registers mirrored tools into a `ToolHost` and removes them again
//! when their backing services disappear. The host dispatches calls by name.
//! `InMemoryToolHost` is a minimal host keyed by tool name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::proxy::errors::ProxyError;

// ─── Handler Types ───────────────────────────────────────────────────────────

/// Arguments the host passes to a proxied tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolInvocation {
    /// UID of the datasource that should serve the call.
    #[serde(default)]
    pub datasource_uid: String,
    /// Arguments forwarded unchanged to the downstream tool.
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Async tool handler shared between the host and the registry.
pub type ToolHandler =
    Arc<dyn Fn(ToolInvocation) -> BoxFuture<'static, Result<String, ProxyError>> + Send + Sync>;

/// Everything the host needs to expose one tool.
#[derive(Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub handler: ToolHandler,
}

impl fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

// ─── ToolHost ────────────────────────────────────────────────────────────────

/// The framework tools are registered into.
///
/// Both methods are synchronous: the registry calls them while holding its
/// own lock.
pub trait ToolHost: Send + Sync {
    /// Add or replace a tool.
    fn register_tool(&self, registration: ToolRegistration);

    /// Remove a tool. Unknown names are ignored.
    fn unregister_tool(&self, name: &str);
}

/// In-process tool host keyed by tool name.
#[derive(Default)]
pub struct InMemoryToolHost {
    tools: RwLock<HashMap<String, ToolRegistration>>,
}

impl InMemoryToolHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a call by tool name with JSON arguments.
    pub async fn call(&self, name: &str, args: serde_json::Value) -> Result<String, ProxyError> {
        let handler = self
            .tools
            .read()
            .get(name)
            .map(|t| t.handler.clone())
            .ok_or_else(|| ProxyError::UnknownTool {
                name: name.to_string(),
            })?;

        let invocation: ToolInvocation =
            serde_json::from_value(args).map_err(|e| ProxyError::ToolFailed {
                tool: name.to_string(),
                reason: format!("invalid arguments: {e}"),
            })?;

        handler(invocation).await
    }

    /// Names of all registered tools, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a registration by name.
    pub fn get(&self, name: &str) -> Option<ToolRegistration> {
        self.tools.read().get(name).cloned()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

impl ToolHost for InMemoryToolHost {
    fn register_tool(&self, registration: ToolRegistration) {
        tracing::debug!(tool_name = %registration.name, "tool registered with host");
        self.tools
            .write()
            .insert(registration.name.clone(), registration);
    }

    fn unregister_tool(&self, name: &str) {
        if self.tools.write().remove(name).is_some() {
            tracing::debug!(tool_name = name, "tool removed from host");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn echo(name: &str) -> ToolRegistration {
        let handler: ToolHandler = Arc::new(|inv: ToolInvocation| {
            async move { Ok(format!("{}:{}", inv.datasource_uid, inv.arguments.len())) }.boxed()
        });
        ToolRegistration {
            name: name.into(),
            description: "echo".into(),
            input_schema: serde_json::json!({"type": "object"}),
            handler,
        }
    }

    #[tokio::test]
    async fn test_call_dispatches_by_name() {
        let host = InMemoryToolHost::new();
        host.register_tool(echo("tempo_echo"));

        let out = host
            .call(
                "tempo_echo",
                serde_json::json!({"datasource_uid": "ds1", "arguments": {"q": 1}}),
            )
            .await
            .unwrap();
        assert_eq!(out, "ds1:1");
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let host = InMemoryToolHost::new();
        let err = host.call("nope", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_call_rejects_malformed_arguments() {
        let host = InMemoryToolHost::new();
        host.register_tool(echo("tempo_echo"));
        let err = host
            .call("tempo_echo", serde_json::json!({"datasource_uid": 5}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ToolFailed { .. }));
    }

    #[test]
    fn test_register_replaces_and_unregister_removes() {
        let host = InMemoryToolHost::new();
        host.register_tool(echo("b"));
        host.register_tool(echo("a"));
        host.register_tool(echo("a"));
        assert_eq!(host.tool_names(), vec!["a".to_string(), "b".to_string()]);

        host.unregister_tool("a");
        host.unregister_tool("a");
        assert_eq!(host.len(), 1);
        assert!(host.get("a").is_none());
        assert!(host.get("b").is_some());
    }
}
