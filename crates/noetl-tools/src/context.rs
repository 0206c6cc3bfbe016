//! Live execution context.
//!
//! The context is the key-value state of one execution. Templates reference
//! keys by dotted paths; step outputs are bound under the step name with
//! `result`/`status` attributes. Nested loop scopes are shallow copies that
//! shadow the parent without mutating it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Context keys that never leave the process in event snapshots.
const PRIVATE_PREFIX: char = '_';
const PRIVATE_KEYS: &[&str] = &["auth", "credential", "credentials", "secrets"];

/// Execution context passed to the engine, iterator, and plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique execution ID.
    pub execution_id: i64,

    /// Current step name.
    pub step: String,

    /// Variables available for template rendering.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    /// Create a new context seeded from a workload.
    ///
    /// The workload is exposed under `workload` and the `work`/`input`
    /// aliases; scalar workload keys are also promoted to the top level so
    /// templates can reference them directly.
    pub fn new(execution_id: i64, workload: serde_json::Value) -> Self {
        let mut variables = HashMap::new();

        if let serde_json::Value::Object(ref map) = workload {
            for (k, v) in map {
                variables.insert(k.clone(), v.clone());
            }
        }

        variables.insert("workload".to_string(), workload.clone());
        variables.insert("work".to_string(), workload.clone());
        variables.insert("input".to_string(), workload);
        variables.insert(
            "execution_id".to_string(),
            serde_json::json!(execution_id.to_string()),
        );

        Self {
            execution_id,
            step: "start".to_string(),
            variables,
        }
    }

    /// Set a variable value.
    pub fn set(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(name.into(), value);
    }

    /// Get a variable value.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Merge a parameter map into the context (step-level `with`).
    pub fn merge(&mut self, params: &serde_json::Value) {
        if let serde_json::Value::Object(map) = params {
            for (k, v) in map {
                self.variables.insert(k.clone(), v.clone());
            }
        }
    }

    /// Bind a step's output under its name.
    ///
    /// Exposes `<step>` as a record with `result`/`status`/`data`, and
    /// rebinds the global `result` to the most recent step output.
    pub fn bind_step_result(
        &mut self,
        step_name: &str,
        data: serde_json::Value,
        status: &str,
    ) {
        let record = serde_json::json!({
            "result": data.clone(),
            "status": status,
            "data": data.clone(),
        });
        self.variables.insert(step_name.to_string(), record);
        self.variables.insert("result".to_string(), data);
    }

    /// Create a child scope for a loop iteration.
    ///
    /// The child shadows the parent: it starts as a shallow copy and carries
    /// the parent's variables under `parent`. Writes to the child never
    /// propagate back.
    pub fn child_scope(&self) -> Self {
        let mut child = self.clone();
        let parent_snapshot = serde_json::Value::Object(
            self.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        child.variables.insert("parent".to_string(), parent_snapshot);
        child
    }

    /// Flatten the context for template rendering.
    pub fn to_template_context(&self) -> HashMap<String, serde_json::Value> {
        let mut ctx = self.variables.clone();
        ctx.entry("execution_id".to_string())
            .or_insert_with(|| serde_json::json!(self.execution_id.to_string()));
        ctx.insert("step".to_string(), serde_json::json!(self.step));
        ctx
    }

    /// Serialize the context for event storage, dropping private keys.
    pub fn sanitized_snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .variables
            .iter()
            .filter(|(k, _)| !k.starts_with(PRIVATE_PREFIX) && !PRIVATE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_seeds_workload() {
        let ctx = ExecutionContext::new(12345, serde_json::json!({"city": "Bergen"}));
        assert_eq!(ctx.get("city"), Some(&serde_json::json!("Bergen")));
        assert_eq!(
            ctx.get("workload"),
            Some(&serde_json::json!({"city": "Bergen"}))
        );
        assert_eq!(ctx.get("work"), ctx.get("input"));
    }

    #[test]
    fn test_bind_step_result() {
        let mut ctx = ExecutionContext::new(1, serde_json::json!({}));
        ctx.bind_step_result(
            "fetch",
            serde_json::json!({"data": {"max_temp": 30}}),
            "success",
        );

        let fetch = ctx.get("fetch").unwrap();
        assert_eq!(fetch["result"]["data"]["max_temp"], serde_json::json!(30));
        assert_eq!(fetch["status"], serde_json::json!("success"));
        assert_eq!(
            ctx.get("result").unwrap()["data"]["max_temp"],
            serde_json::json!(30)
        );
    }

    #[test]
    fn test_child_scope_shadows() {
        let mut parent = ExecutionContext::new(1, serde_json::json!({"a": 1}));
        let mut child = parent.child_scope();
        child.set("a", serde_json::json!(99));

        assert_eq!(child.get("a"), Some(&serde_json::json!(99)));
        assert_eq!(parent.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(
            child.get("parent").unwrap()["a"],
            serde_json::json!(1)
        );

        // parent stays mutable independently
        parent.set("b", serde_json::json!(2));
        assert!(child.get("b").is_none());
    }

    #[test]
    fn test_sanitized_snapshot_drops_private_keys() {
        let mut ctx = ExecutionContext::new(1, serde_json::json!({}));
        ctx.set("_loop", serde_json::json!({"index": 0}));
        ctx.set("auth", serde_json::json!({"password": "x"}));
        ctx.set("city", serde_json::json!("Oslo"));

        let snapshot = ctx.sanitized_snapshot();
        assert!(snapshot.get("_loop").is_none());
        assert!(snapshot.get("auth").is_none());
        assert_eq!(snapshot["city"], serde_json::json!("Oslo"));
    }

    #[test]
    fn test_to_template_context() {
        let ctx = ExecutionContext::new(42, serde_json::json!({"k": "v"}));
        let tctx = ctx.to_template_context();
        assert_eq!(tctx.get("k"), Some(&serde_json::json!("v")));
        assert_eq!(tctx.get("step"), Some(&serde_json::json!("start")));
    }
}
