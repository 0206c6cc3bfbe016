//! Tool registry and dispatch.
//!
//! Plugins are dispatched by their tool identifier. Panics and errors inside
//! a plugin never escape: the registry converts them into an error result
//! envelope.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::result::ToolResult;

/// Configuration for one task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool identifier (e.g., "http", "postgres", "duckdb", "python").
    #[serde(alias = "kind", alias = "type")]
    pub tool: String,

    /// Tool-specific configuration.
    #[serde(flatten)]
    pub config: serde_json::Value,

    /// Timeout in seconds (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Authentication configuration: string key, single-mode map, or alias
    /// map (see the auth resolver).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
}

impl ToolConfig {
    /// Build a config from a tool identifier and a JSON body.
    pub fn new(tool: impl Into<String>, config: serde_json::Value) -> Self {
        let mut config = config;
        let (auth, timeout) = match config.as_object_mut() {
            Some(map) => (
                map.remove("auth"),
                map.remove("timeout").and_then(|v| v.as_u64()),
            ),
            None => (None, None),
        };
        Self {
            tool: tool.into(),
            config,
            timeout,
            auth,
        }
    }

    /// Fetch a field from the tool-specific configuration.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.config.get(name)
    }

    /// Split a task body into its tool config, sink block, and return
    /// transform.
    pub fn from_task(
        task: &serde_json::Value,
    ) -> Result<(Self, Option<serde_json::Value>, Option<serde_json::Value>), crate::error::ToolError>
    {
        let tool = task
            .get("tool")
            .or_else(|| task.get("type"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                crate::error::ToolError::Configuration(
                    "task requires a 'tool' identifier".to_string(),
                )
            })?
            .to_string();

        let mut body = task.clone();
        if crate::auth::normalize_legacy_auth(&mut body) {
            tracing::warn!("legacy 'credential' field rewritten as 'auth'");
        }
        let (sink, return_expr) = match body.as_object_mut() {
            Some(map) => {
                map.remove("tool");
                map.remove("type");
                map.remove("name");
                (map.remove("sink"), map.remove("return"))
            }
            None => (None, None),
        };

        Ok((Self::new(tool, body), sink, return_expr))
    }
}

/// Tool trait implemented by every task plugin.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's unique identifier.
    fn name(&self) -> &'static str;

    /// Execute the tool with the given configuration and context.
    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, ToolError>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by identifier.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool identifiers.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Execute a tool, converting failures and panics into error envelopes.
    pub async fn execute(&self, config: &ToolConfig, ctx: &ExecutionContext) -> ToolResult {
        let tool = match self.get(&config.tool) {
            Some(t) => t,
            None => return ToolResult::error(format!("Tool not found: {}", config.tool)),
        };

        let start = std::time::Instant::now();
        let outcome = std::panic::AssertUnwindSafe(tool.execute(config, ctx))
            .catch_unwind()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                if result.duration_ms.is_some() {
                    result
                } else {
                    result.with_duration(duration_ms)
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = %config.tool, error = %e, "Tool execution failed");
                ToolResult::error(e.to_string()).with_duration(duration_ms)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                tracing::error!(tool = %config.tool, panic = %message, "Tool panicked");
                ToolResult::error(format!("panic in tool '{}': {}", config.tool, message))
                    .with_traceback(message)
                    .with_duration(duration_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(
            &self,
            config: &ToolConfig,
            _ctx: &ExecutionContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::success(config.config.clone()))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &'static str {
            "fail"
        }

        async fn execute(
            &self,
            _config: &ToolConfig,
            _ctx: &ExecutionContext,
        ) -> Result<ToolResult, ToolError> {
            Err(ToolError::ExecutionFailed("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let config = ToolConfig::new("echo", serde_json::json!({"message": "hi"}));
        let ctx = ExecutionContext::default();

        let result = registry.execute(&config, &ctx).await;
        assert!(result.is_success());
        assert_eq!(result.data.unwrap()["message"], serde_json::json!("hi"));
        assert!(result.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_registry_unknown_tool() {
        let registry = ToolRegistry::new();
        let config = ToolConfig::new("missing", serde_json::json!({}));
        let ctx = ExecutionContext::default();

        let result = registry.execute(&config, &ctx).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_registry_error_becomes_envelope() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailTool));

        let config = ToolConfig::new("fail", serde_json::json!({}));
        let ctx = ExecutionContext::default();

        let result = registry.execute(&config, &ctx).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("boom"));
    }

    #[test]
    fn test_tool_config_extracts_auth() {
        let config = ToolConfig::new(
            "postgres",
            serde_json::json!({"command": "U0VMRUNUIDE7", "auth": "pg_local"}),
        );
        assert_eq!(config.auth, Some(serde_json::json!("pg_local")));
        assert!(config.field("auth").is_none());
        assert!(config.field("command").is_some());
    }
}
