//! Paginated HTTP iteration.
//!
//! Repeats an HTTP task while `continue_while` stays truthy, bounded by
//! `max_iterations`. Each page executes with retry, merges into the
//! accumulator per the configured strategy over an optional dotted
//! `merge_path`, optionally persists through a per-page sink, and updates the
//! next request from `next_page` templates with `{iteration, accumulated,
//! response}` bound.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::iter::{IterOutcome, LoopSpec};
use crate::result::ToolStatus;
use crate::sink::SinkExecutor;
use crate::template::TemplateEngine;
use crate::tools::HttpTool;

/// Default bound on page fetches.
const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// How page data folds into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Push each page's extracted data as one element.
    #[default]
    Append,
    /// Extend the accumulator with the extracted array's elements.
    Extend,
    /// Keep only the last page's extracted data.
    Replace,
    /// Push `{iteration, data}` records.
    Collect,
    /// Do not accumulate; pages only flow to the sink.
    SinkOnly,
}

/// Retry behavior for one page fetch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    /// Seconds before the first retry.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,

    /// Ceiling on the delay in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    10.0
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetrySpec {
    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay_secs(&self, attempt: u32) -> f64 {
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                (self.initial_delay * 2f64.powi(attempt as i32)).min(self.max_delay)
            }
        }
    }
}

/// Run the paginated variant of a loop.
pub async fn run_paginated(
    http: Arc<HttpTool>,
    sink: Arc<SinkExecutor>,
    template: Arc<TemplateEngine>,
    spec: &LoopSpec,
    pagination: &Value,
    ctx: &ExecutionContext,
) -> Result<IterOutcome, ToolError> {
    let task = spec.task.clone().ok_or_else(|| {
        ToolError::Iterator("pagination requires a nested http task".to_string())
    })?;

    let continue_while = pagination
        .get("continue_while")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::Iterator("pagination requires 'continue_while'".to_string()))?
        .to_string();

    let merge_strategy: MergeStrategy = pagination
        .get("merge_strategy")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let merge_path = pagination
        .get("merge_path")
        .and_then(|v| v.as_str())
        .map(String::from);
    let max_iterations = pagination
        .get("max_iterations")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);
    let retry: RetrySpec = pagination
        .get("retry")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let next_page = pagination.get("next_page").cloned();
    let page_sink = pagination.get("sink").cloned();

    // Initial request pieces from the nested http task
    let base_ctx = ctx.to_template_context();
    let rendered_task = template.render_value(&task, &base_ctx)?;
    let mut endpoint = rendered_task
        .get("endpoint")
        .or_else(|| rendered_task.get("url"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::Iterator("pagination task requires 'endpoint'".to_string()))?
        .to_string();
    let method = rendered_task
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_uppercase();
    let mut headers: HashMap<String, String> = rendered_task
        .get("headers")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        v.as_str().map(String::from).unwrap_or_else(|| v.to_string()),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    let mut query = rendered_task
        .get("params")
        .cloned()
        .or_else(|| rendered_task.get("data").cloned());
    let mut body: Option<Value> = rendered_task.get("payload").cloned();

    let mut accumulated = initial_accumulator(merge_strategy);
    let mut iteration = 0usize;

    while iteration < max_iterations {
        let response =
            fetch_with_retry(&http, &method, &endpoint, &headers, &query, &body, &retry).await?;

        iteration += 1;
        accumulated = merge_response(accumulated, &response, merge_strategy, merge_path.as_deref());

        let mut page_ctx = base_ctx.clone();
        page_ctx.insert("iteration".to_string(), serde_json::json!(iteration));
        page_ctx.insert("accumulated".to_string(), accumulated.clone());
        page_ctx.insert("response".to_string(), response.clone());

        if let Some(ref sink_spec) = page_sink {
            sink.execute(sink_spec, &page_ctx)
                .await
                .map_err(|e| ToolError::Sink(format!("page sink failed: {}", e)))?;
        }

        let should_continue = template
            .evaluate_condition(&continue_while, &page_ctx)
            .unwrap_or(false);
        if !should_continue {
            break;
        }

        // Update the next request from next_page templates
        if let Some(ref next) = next_page {
            let updates = template.render_value(next, &page_ctx)?;
            if let Some(new_endpoint) = updates.get("endpoint").and_then(|v| v.as_str()) {
                endpoint = new_endpoint.to_string();
            }
            if let Some(new_params) = updates.get("params") {
                query = Some(merge_objects(query.take(), new_params.clone()));
            }
            if let Some(new_body) = updates.get("body") {
                body = Some(merge_objects(body.take(), new_body.clone()));
            }
            if let Some(Value::Object(new_headers)) = updates.get("headers") {
                for (k, v) in new_headers {
                    headers.insert(
                        k.clone(),
                        v.as_str().map(String::from).unwrap_or_else(|| v.to_string()),
                    );
                }
            }
        }
    }

    if iteration >= max_iterations {
        tracing::warn!(max_iterations, "pagination stopped at iteration bound");
    }

    let data = match accumulated {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    Ok(IterOutcome {
        status: ToolStatus::Success,
        data,
        errors: Vec::new(),
    })
}

/// Fetch one page, retrying transient failures per the retry spec.
async fn fetch_with_retry(
    http: &HttpTool,
    method: &str,
    endpoint: &str,
    headers: &HashMap<String, String>,
    query: &Option<Value>,
    body: &Option<Value>,
    retry: &RetrySpec,
) -> Result<Value, ToolError> {
    let attempts = retry.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match http
            .request_raw(method, endpoint, headers, query.as_ref(), body.as_ref(), None)
            .await
        {
            Ok((status_code, response_headers, data)) if (200..300).contains(&status_code) => {
                return Ok(serde_json::json!({
                    "data": data,
                    "status_code": status_code,
                    "headers": response_headers,
                }));
            }
            Ok((status_code, _, _)) => {
                last_error = Some(ToolError::Http(format!(
                    "HTTP {} from {}",
                    status_code, endpoint
                )));
            }
            Err(e) => {
                last_error = Some(e);
            }
        }

        if attempt + 1 < attempts {
            let delay = retry.delay_secs(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                delay_secs = delay,
                endpoint,
                "page fetch failed, retrying"
            );
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| ToolError::Http("page fetch failed".to_string())))
}

fn initial_accumulator(strategy: MergeStrategy) -> Value {
    match strategy {
        MergeStrategy::Replace | MergeStrategy::SinkOnly => Value::Null,
        _ => Value::Array(Vec::new()),
    }
}

/// Fold one response into the accumulator.
fn merge_response(
    accumulated: Value,
    response: &Value,
    strategy: MergeStrategy,
    merge_path: Option<&str>,
) -> Value {
    let extracted = match merge_path {
        Some(path) => extract_path(response, path).unwrap_or(Value::Null),
        None => response.clone(),
    };

    match strategy {
        MergeStrategy::Append => {
            let mut items = as_array(accumulated);
            items.push(extracted);
            Value::Array(items)
        }
        MergeStrategy::Extend => {
            let mut items = as_array(accumulated);
            match extracted {
                Value::Array(new_items) => items.extend(new_items),
                other => items.push(other),
            }
            Value::Array(items)
        }
        MergeStrategy::Replace => extracted,
        MergeStrategy::Collect => {
            let mut items = as_array(accumulated);
            let iteration = items.len() + 1;
            items.push(serde_json::json!({"iteration": iteration, "data": extracted}));
            Value::Array(items)
        }
        MergeStrategy::SinkOnly => Value::Null,
    }
}

/// Walk a dotted path through a JSON value.
fn extract_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn as_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn merge_objects(base: Option<Value>, updates: Value) -> Value {
    match (base, updates) {
        (Some(Value::Object(mut base)), Value::Object(updates)) => {
            for (k, v) in updates {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, updates) => updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthResolver, MemoryCredentialSource};
    use crate::event::MemoryEmitter;
    use crate::iter::IteratorController;
    use crate::registry::ToolRegistry;
    use crate::tools::{MockResponse, MockTransport};

    fn page(items: Vec<i64>, next: Option<i64>) -> Value {
        serde_json::json!({
            "items": items,
            "next": next,
        })
    }

    fn controller_with_mock(mock: Arc<MockTransport>) -> (IteratorController, Arc<HttpTool>) {
        let resolver = Arc::new(AuthResolver::new(Arc::new(MemoryCredentialSource::new())));
        let http = Arc::new(HttpTool::with_mock(Arc::clone(&resolver), mock));
        let sink = Arc::new(SinkExecutor::new(Arc::clone(&resolver), Arc::clone(&http)));
        let emitter = Arc::new(MemoryEmitter::new());
        let controller = IteratorController::new(
            Arc::new(ToolRegistry::new()),
            sink,
            emitter as Arc<dyn crate::event::EventEmitter>,
            Arc::clone(&http),
        );
        (controller, http)
    }

    #[tokio::test]
    async fn test_three_pages_extend_with_merge_path() {
        let mock = Arc::new(MockTransport::new());
        mock.register(
            r"/items",
            vec![
                MockResponse::ok(page((0..10).collect(), Some(2))),
                MockResponse::ok(page((10..20).collect(), Some(3))),
                MockResponse::ok(page((20..30).collect(), None)),
            ],
        );
        let (controller, http) = controller_with_mock(Arc::clone(&mock));

        let spec = LoopSpec::parse(&serde_json::json!({
            "task": {
                "tool": "http",
                "endpoint": "http://api.local/items",
                "method": "GET",
                "params": {"page": 1}
            },
            "pagination": {
                "continue_while": "{{ response.data.next != none }}",
                "merge_strategy": "extend",
                "merge_path": "data.items",
                "next_page": {
                    "params": {"page": "{{ response.data.next }}"}
                }
            }
        }))
        .unwrap();

        let ctx = ExecutionContext::new(1, serde_json::json!({}));
        let outcome = controller
            .run(&spec, &ctx, &serde_json::json!({}), "pages")
            .await
            .unwrap();

        assert_eq!(outcome.status, ToolStatus::Success);
        assert_eq!(outcome.data.len(), 30);
        assert_eq!(outcome.data[29], serde_json::json!(29));
        // exactly three requests issued
        assert_eq!(http.mock().requests().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_exponential_then_success() {
        let mock = Arc::new(MockTransport::new());
        mock.register(
            r"/flaky",
            vec![
                MockResponse::error(500),
                MockResponse::error(500),
                MockResponse::ok(page(vec![1], None)),
            ],
        );
        let (controller, http) = controller_with_mock(Arc::clone(&mock));

        let spec = LoopSpec::parse(&serde_json::json!({
            "task": {"tool": "http", "endpoint": "http://api.local/flaky"},
            "pagination": {
                "continue_while": "{{ response.data.next != none }}",
                "merge_strategy": "extend",
                "merge_path": "data.items",
                "retry": {
                    "max_attempts": 3,
                    "backoff": "exponential",
                    "initial_delay": 0.01,
                    "max_delay": 0.05
                }
            }
        }))
        .unwrap();

        let ctx = ExecutionContext::new(1, serde_json::json!({}));
        let outcome = controller
            .run(&spec, &ctx, &serde_json::json!({}), "retry")
            .await
            .unwrap();

        assert_eq!(outcome.data, vec![serde_json::json!(1)]);
        assert_eq!(http.mock().requests().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_error() {
        let mock = Arc::new(MockTransport::new());
        mock.register(r"/down", vec![MockResponse::error(503)]);
        let (controller, _http) = controller_with_mock(mock);

        let spec = LoopSpec::parse(&serde_json::json!({
            "task": {"tool": "http", "endpoint": "http://api.local/down"},
            "pagination": {
                "continue_while": "false",
                "retry": {"max_attempts": 2, "initial_delay": 0.01}
            }
        }))
        .unwrap();

        let ctx = ExecutionContext::new(1, serde_json::json!({}));
        let result = controller
            .run(&spec, &ctx, &serde_json::json!({}), "down")
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_strategies() {
        let response = serde_json::json!({"data": {"items": [1, 2]}});

        let acc = merge_response(Value::Array(vec![]), &response, MergeStrategy::Extend, Some("data.items"));
        assert_eq!(acc, serde_json::json!([1, 2]));

        let acc = merge_response(acc, &response, MergeStrategy::Extend, Some("data.items"));
        assert_eq!(acc, serde_json::json!([1, 2, 1, 2]));

        let acc = merge_response(Value::Array(vec![]), &response, MergeStrategy::Append, Some("data.items"));
        assert_eq!(acc, serde_json::json!([[1, 2]]));

        let acc = merge_response(Value::Null, &response, MergeStrategy::Replace, Some("data.items"));
        assert_eq!(acc, serde_json::json!([1, 2]));

        let acc = merge_response(Value::Array(vec![]), &response, MergeStrategy::Collect, None);
        assert_eq!(acc[0]["iteration"], serde_json::json!(1));

        let acc = merge_response(Value::Null, &response, MergeStrategy::SinkOnly, None);
        assert_eq!(acc, Value::Null);
    }

    #[test]
    fn test_extract_path() {
        let value = serde_json::json!({"a": {"b": [{"c": 5}]}});
        assert_eq!(extract_path(&value, "a.b.0.c"), Some(serde_json::json!(5)));
        assert_eq!(extract_path(&value, "a.missing"), None);
    }

    #[test]
    fn test_retry_delays() {
        let retry = RetrySpec {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay: 1.0,
            max_delay: 10.0,
        };
        assert_eq!(retry.delay_secs(0), 1.0);
        assert_eq!(retry.delay_secs(1), 2.0);
        assert_eq!(retry.delay_secs(4), 10.0);

        let fixed = RetrySpec::default();
        assert_eq!(fixed.delay_secs(3), 1.0);
    }
}
