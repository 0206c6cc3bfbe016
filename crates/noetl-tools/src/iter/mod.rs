//! Iterator/loop controller.
//!
//! Iterates a collection running a nested task per element. Supports
//! filtering (`where`), stable ordering (`order_by`), `limit`, `chunk`
//! batching, `enumerate`, sequential and bounded-parallel execution, and a
//! paginated HTTP variant. Results always come back in post-filter-and-sort
//! logical order regardless of completion order; errors are collected per
//! iteration with partial data preserved.

pub mod pagination;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::event::{EventDraft, EventEmitter, EventStatus, EventType, LoopState};
use crate::registry::{ToolConfig, ToolRegistry};
use crate::result::ToolStatus;
use crate::sink::SinkExecutor;
use crate::template::TemplateEngine;
use crate::tools::HttpTool;

/// Default worker count for async mode.
const DEFAULT_CONCURRENCY: usize = 8;

/// Iteration execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterMode {
    #[default]
    Sequential,
    #[serde(alias = "parallel")]
    Async,
}

/// Parsed loop configuration.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub collection: Option<Value>,
    pub element: String,
    pub mode: IterMode,
    pub concurrency: usize,
    pub enumerate: bool,
    pub where_expr: Option<String>,
    pub limit: Option<usize>,
    pub chunk: Option<usize>,
    pub order_by: Option<String>,
    pub task: Option<Value>,
    /// Aggregated sink (legacy flat form only).
    pub sink: Option<Value>,
    pub pagination: Option<Value>,
}

impl LoopSpec {
    /// Parse a loop block from task or step configuration.
    pub fn parse(config: &Value) -> Result<Self, ToolError> {
        let element = config
            .get("element")
            .or_else(|| config.get("iterator"))
            .and_then(|v| v.as_str())
            .unwrap_or("item")
            .to_string();

        let mode: IterMode = config
            .get("mode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let concurrency = config
            .get("concurrency")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CONCURRENCY)
            .max(1);

        Ok(Self {
            collection: config
                .get("collection")
                .or_else(|| config.get("data"))
                .or_else(|| config.get("in"))
                .cloned(),
            element,
            mode,
            concurrency,
            enumerate: config
                .get("enumerate")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            where_expr: config
                .get("where")
                .and_then(|v| v.as_str())
                .map(String::from),
            limit: config
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize),
            chunk: config
                .get("chunk")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .filter(|n| *n > 0),
            order_by: config
                .get("order_by")
                .and_then(|v| v.as_str())
                .map(String::from),
            task: config.get("task").cloned(),
            sink: config.get("sink").cloned(),
            pagination: config.get("pagination").cloned(),
        })
    }
}

/// Outcome of one iterator run.
#[derive(Debug, Clone)]
pub struct IterOutcome {
    pub status: ToolStatus,
    /// Per-iteration results in logical-index order.
    pub data: Vec<Value>,
    /// `{index, message}` records for failed iterations.
    pub errors: Vec<Value>,
}

impl IterOutcome {
    /// Render the outcome as a result payload.
    pub fn to_value(&self) -> Value {
        let mut out = serde_json::json!({
            "status": self.status.to_string(),
            "data": self.data,
        });
        if !self.errors.is_empty() {
            out["errors"] = serde_json::json!(self.errors);
        }
        out
    }
}

/// Runs nested tasks over a collection.
pub struct IteratorController {
    registry: Arc<ToolRegistry>,
    template: Arc<TemplateEngine>,
    sink: Arc<SinkExecutor>,
    emitter: Arc<dyn EventEmitter>,
    http: Arc<HttpTool>,
}

impl IteratorController {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sink: Arc<SinkExecutor>,
        emitter: Arc<dyn EventEmitter>,
        http: Arc<HttpTool>,
    ) -> Self {
        Self {
            registry,
            template: Arc::new(TemplateEngine::new()),
            sink,
            emitter,
            http,
        }
    }

    /// Run the loop described by `spec` with `task_with` parameters bound.
    pub async fn run(
        &self,
        spec: &LoopSpec,
        ctx: &ExecutionContext,
        task_with: &Value,
        loop_name: &str,
    ) -> Result<IterOutcome, ToolError> {
        if let Some(ref pagination) = spec.pagination {
            return pagination::run_paginated(
                Arc::clone(&self.http),
                Arc::clone(&self.sink),
                Arc::clone(&self.template),
                spec,
                pagination,
                ctx,
            )
            .await;
        }

        let task = spec.task.clone().ok_or_else(|| {
            ToolError::Iterator("loop requires a nested 'task'".to_string())
        })?;

        let loop_ctx = build_loop_context(ctx, task_with);
        let items = self.resolve_collection(spec, &loop_ctx, task_with, ctx)?;

        let loop_id = uuid::Uuid::new_v4().to_string();
        self.emitter
            .emit(
                EventDraft::new(ctx.execution_id, EventType::IteratorStarted, EventStatus::InProgress)
                    .with_node(loop_name, "iterator")
                    .with_loop(LoopState {
                        loop_id: Some(loop_id.clone()),
                        loop_name: Some(loop_name.to_string()),
                        iterator: Some(spec.element.clone()),
                        items: Some(serde_json::json!(items)),
                        ..Default::default()
                    }),
            )
            .await?;

        // Filter, sort, trim, chunk
        let filtered = self
            .apply_where(spec, &items, &loop_ctx, ctx, loop_name, &loop_id)
            .await?;
        let ordered = self.apply_order_by(spec, filtered, &loop_ctx);
        let trimmed: Vec<Value> = match spec.limit {
            Some(limit) => ordered.into_iter().take(limit).collect(),
            None => ordered,
        };
        let batches: Vec<Value> = match spec.chunk {
            Some(size) => trimmed
                .chunks(size)
                .map(|chunk| Value::Array(chunk.to_vec()))
                .collect(),
            None => trimmed,
        };

        // Execute iterations
        let total = batches.len();
        let mut slots: Vec<Option<IterationResult>> = vec![None; total];

        let parallel = spec.mode == IterMode::Async && spec.concurrency > 1 && total > 1;
        if parallel {
            let semaphore = Arc::new(Semaphore::new(spec.concurrency));
            let mut set: JoinSet<IterationResult> = JoinSet::new();

            for (index, item) in batches.into_iter().enumerate() {
                let permit_source = Arc::clone(&semaphore);
                let worker = IterationWorker {
                    registry: Arc::clone(&self.registry),
                    sink: Arc::clone(&self.sink),
                    emitter: Arc::clone(&self.emitter),
                    task: task.clone(),
                    spec_element: spec.element.clone(),
                    enumerate: spec.enumerate,
                    loop_id: loop_id.clone(),
                    loop_name: loop_name.to_string(),
                    total,
                };
                let ctx = ctx.clone();
                set.spawn(async move {
                    let _permit = permit_source.acquire_owned().await;
                    worker.run_iteration(index, item, &ctx).await
                });
            }

            while let Some(joined) = set.join_next().await {
                let result = joined.map_err(|e| {
                    ToolError::Iterator(format!("iteration task join error: {}", e))
                })?;
                let index = result.index;
                slots[index] = Some(result);
            }
        } else {
            let worker = IterationWorker {
                registry: Arc::clone(&self.registry),
                sink: Arc::clone(&self.sink),
                emitter: Arc::clone(&self.emitter),
                task: task.clone(),
                spec_element: spec.element.clone(),
                enumerate: spec.enumerate,
                loop_id: loop_id.clone(),
                loop_name: loop_name.to_string(),
                total,
            };
            for (index, item) in batches.into_iter().enumerate() {
                let result = worker.run_iteration(index, item, ctx).await;
                slots[index] = Some(result);
            }
        }

        // Reassemble in logical order
        let mut data = Vec::with_capacity(total);
        let mut errors = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(result) => {
                    if let Some(message) = result.error {
                        errors.push(serde_json::json!({"index": index, "message": message}));
                    }
                    data.push(result.data);
                }
                None => {
                    errors.push(serde_json::json!({
                        "index": index,
                        "message": "iteration produced no result"
                    }));
                    data.push(Value::Null);
                }
            }
        }

        // Aggregated sink (legacy flat form)
        if let Some(ref sink_spec) = spec.sink {
            let mut sink_ctx = loop_ctx.clone();
            sink_ctx.insert("data".to_string(), serde_json::json!(data));
            sink_ctx.insert("results".to_string(), serde_json::json!(data));
            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::SaveStarted, EventStatus::InProgress)
                        .with_node(loop_name, "sink"),
                )
                .await?;
            match self.sink.execute(sink_spec, &sink_ctx).await {
                Ok(saved) => {
                    self.emitter
                        .emit(
                            EventDraft::new(
                                ctx.execution_id,
                                EventType::SaveCompleted,
                                EventStatus::Success,
                            )
                            .with_node(loop_name, "sink")
                            .with_result(saved),
                        )
                        .await?;
                }
                Err(e) => {
                    self.emitter
                        .emit(
                            EventDraft::new(ctx.execution_id, EventType::SaveFailed, EventStatus::Error)
                                .with_node(loop_name, "sink")
                                .with_error(e.to_string()),
                        )
                        .await?;
                    return Err(ToolError::Sink(format!(
                        "aggregated sink failed: {}",
                        e
                    )));
                }
            }
        }

        let status = if errors.is_empty() {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };

        self.emitter
            .emit(
                EventDraft::new(
                    ctx.execution_id,
                    EventType::IteratorCompleted,
                    if errors.is_empty() { EventStatus::Success } else { EventStatus::Error },
                )
                .with_node(loop_name, "iterator")
                .with_loop(LoopState {
                    loop_id: Some(loop_id),
                    loop_name: Some(loop_name.to_string()),
                    iterator: Some(spec.element.clone()),
                    results: Some(serde_json::json!(data)),
                    ..Default::default()
                }),
            )
            .await?;

        Ok(IterOutcome { status, data, errors })
    }

    /// Resolve and coerce the collection to a sequence.
    fn resolve_collection(
        &self,
        spec: &LoopSpec,
        loop_ctx: &HashMap<String, Value>,
        task_with: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Value>, ToolError> {
        let expr = match &spec.collection {
            Some(value) => Some(value.clone()),
            None => lookup_collection_fallback(&spec.element, task_with, ctx),
        };

        let Some(expr) = expr else {
            return Err(ToolError::Iterator(format!(
                "iterator requires a 'collection'; no candidate found for element '{}'",
                spec.element
            )));
        };

        let resolved = match expr {
            Value::String(s) => self.template.render_to_value(&s, loop_ctx)?,
            other => self.template.render_value(&other, loop_ctx)?,
        };

        coerce_items(resolved)
    }

    /// Drop items whose `where` predicate is not truthy.
    async fn apply_where(
        &self,
        spec: &LoopSpec,
        items: &[Value],
        loop_ctx: &HashMap<String, Value>,
        ctx: &ExecutionContext,
        loop_name: &str,
        loop_id: &str,
    ) -> Result<Vec<Value>, ToolError> {
        let Some(ref where_expr) = spec.where_expr else {
            return Ok(items.to_vec());
        };

        let mut kept = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let mut eval_ctx = loop_ctx.clone();
            eval_ctx.insert(spec.element.clone(), item.clone());

            // predicate render errors drop the item
            let truthy = self
                .template
                .evaluate_condition(where_expr, &eval_ctx)
                .unwrap_or(false);

            if truthy {
                kept.push(item.clone());
            } else {
                self.emitter
                    .emit(
                        EventDraft::new(
                            ctx.execution_id,
                            EventType::IterationFiltered,
                            EventStatus::Filtered,
                        )
                        .with_node(loop_name, "iteration")
                        .with_loop(LoopState {
                            loop_id: Some(loop_id.to_string()),
                            loop_name: Some(loop_name.to_string()),
                            current_index: Some(index as i64),
                            current_item: Some(item.clone()),
                            ..Default::default()
                        }),
                    )
                    .await?;
            }
        }
        Ok(kept)
    }

    /// Stable sort by the rendered `order_by` key; best-effort on errors.
    fn apply_order_by(
        &self,
        spec: &LoopSpec,
        items: Vec<Value>,
        loop_ctx: &HashMap<String, Value>,
    ) -> Vec<Value> {
        let Some(ref order_by) = spec.order_by else {
            return items;
        };

        let mut keyed: Vec<(usize, Value, Value)> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut key_ctx = loop_ctx.clone();
                key_ctx.insert(spec.element.clone(), item.clone());
                let key = self
                    .template
                    .render_to_value(order_by, &key_ctx)
                    .unwrap_or(Value::Null);
                (index, key, item)
            })
            .collect();

        keyed.sort_by(|a, b| compare_keys(&a.1, &b.1).then(a.0.cmp(&b.0)));
        keyed.into_iter().map(|(_, _, item)| item).collect()
    }
}

/// One iteration's result with its logical index.
#[derive(Debug, Clone)]
struct IterationResult {
    index: usize,
    data: Value,
    error: Option<String>,
}

/// The per-iteration execution unit; each spawned worker owns one.
struct IterationWorker {
    registry: Arc<ToolRegistry>,
    sink: Arc<SinkExecutor>,
    emitter: Arc<dyn EventEmitter>,
    task: Value,
    spec_element: String,
    enumerate: bool,
    loop_id: String,
    loop_name: String,
    total: usize,
}

impl IterationWorker {
    async fn run_iteration(
        &self,
        index: usize,
        item: Value,
        parent: &ExecutionContext,
    ) -> IterationResult {
        match self.try_iteration(index, item, parent).await {
            Ok(result) => result,
            // Event emission failures and other infrastructure errors
            // surface as iteration errors, never panics.
            Err(e) => IterationResult {
                index,
                data: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }

    async fn try_iteration(
        &self,
        index: usize,
        item: Value,
        parent: &ExecutionContext,
    ) -> Result<IterationResult, ToolError> {
        // Iteration scope: shadow the parent, bind the element and loop record
        let mut iter_ctx = parent.child_scope();
        iter_ctx.set(self.spec_element.clone(), item.clone());
        iter_ctx.set(
            "_loop",
            serde_json::json!({
                "loop_id": self.loop_id,
                "loop_name": self.loop_name,
                "index": index,
                "count": self.total,
                "item": item,
            }),
        );
        if self.enumerate {
            iter_ctx.set("index", serde_json::json!(index));
        }

        let loop_state = |current: &Value| LoopState {
            loop_id: Some(self.loop_id.clone()),
            loop_name: Some(self.loop_name.clone()),
            iterator: Some(self.spec_element.clone()),
            current_index: Some(index as i64),
            current_item: Some(current.clone()),
            ..Default::default()
        };

        self.emitter
            .emit(
                EventDraft::new(
                    parent.execution_id,
                    EventType::IterationStarted,
                    EventStatus::InProgress,
                )
                .with_node(&self.loop_name, "iteration")
                .with_loop(loop_state(&item)),
            )
            .await?;

        let (config, sink_spec, _return_expr) = ToolConfig::from_task(&self.task)?;

        self.emitter
            .emit(
                EventDraft::new(parent.execution_id, EventType::TaskStart, EventStatus::InProgress)
                    .with_node(&config.tool, "task")
                    .with_context(iter_ctx.sanitized_snapshot()),
            )
            .await?;

        let result = self.registry.execute(&config, &iter_ctx).await;

        if result.is_success() {
            self.emitter
                .emit(
                    EventDraft::new(
                        parent.execution_id,
                        EventType::TaskComplete,
                        EventStatus::Success,
                    )
                    .with_node(&config.tool, "task")
                    .with_duration(result.duration_ms.unwrap_or(0) as i64),
                )
                .await?;
        } else {
            self.emitter
                .emit(
                    EventDraft::new(parent.execution_id, EventType::TaskError, EventStatus::Error)
                        .with_node(&config.tool, "task")
                        .with_error(result.error.clone().unwrap_or_default())
                        .with_duration(result.duration_ms.unwrap_or(0) as i64),
                )
                .await?;

            let message = result.error.unwrap_or_else(|| "task failed".to_string());
            self.emitter
                .emit(
                    EventDraft::new(
                        parent.execution_id,
                        EventType::IterationFailed,
                        EventStatus::Error,
                    )
                    .with_node(&self.loop_name, "iteration")
                    .with_error(message.clone())
                    .with_loop(loop_state(&item)),
                )
                .await?;
            return Ok(IterationResult {
                index,
                data: result.data.unwrap_or(Value::Null),
                error: Some(message),
            });
        }

        let mut data = result.data.unwrap_or(Value::Null);

        // Per-item sink: failure fails the iteration
        if let Some(ref sink_spec) = sink_spec {
            let mut sink_ctx = iter_ctx.to_template_context();
            sink_ctx.insert("data".to_string(), data.clone());
            sink_ctx.insert("result".to_string(), data.clone());

            self.emitter
                .emit(
                    EventDraft::new(parent.execution_id, EventType::SaveStarted, EventStatus::InProgress)
                        .with_node(&self.loop_name, "sink"),
                )
                .await?;

            match self.sink.execute(sink_spec, &sink_ctx).await {
                Ok(saved) => {
                    self.emitter
                        .emit(
                            EventDraft::new(
                                parent.execution_id,
                                EventType::SaveCompleted,
                                EventStatus::Success,
                            )
                            .with_node(&self.loop_name, "sink")
                            .with_result(saved.clone()),
                        )
                        .await?;
                    // attach sink metadata to the iteration result
                    if let Value::Object(ref mut map) = data {
                        map.insert("save_meta".to_string(), saved["meta"].clone());
                    } else {
                        data = serde_json::json!({
                            "data": data,
                            "save_meta": saved["meta"],
                        });
                    }
                }
                Err(e) => {
                    self.emitter
                        .emit(
                            EventDraft::new(parent.execution_id, EventType::SaveFailed, EventStatus::Error)
                                .with_node(&self.loop_name, "sink")
                                .with_error(e.to_string()),
                        )
                        .await?;
                    self.emitter
                        .emit(
                            EventDraft::new(
                                parent.execution_id,
                                EventType::IterationFailed,
                                EventStatus::Error,
                            )
                            .with_node(&self.loop_name, "iteration")
                            .with_error(e.to_string())
                            .with_loop(loop_state(&item)),
                        )
                        .await?;
                    return Ok(IterationResult {
                        index,
                        data: Value::Null,
                        error: Some(format!("sink failed: {}", e)),
                    });
                }
            }
        }

        self.emitter
            .emit(
                EventDraft::new(
                    parent.execution_id,
                    EventType::IterationCompleted,
                    EventStatus::Success,
                )
                .with_node(&self.loop_name, "iteration")
                .with_result(data.clone())
                .with_loop(loop_state(&item)),
            )
            .await?;

        Ok(IterationResult {
            index,
            data,
            error: None,
        })
    }
}

/// Merge work/workload/input sections and with-params into a flat context.
fn build_loop_context(ctx: &ExecutionContext, task_with: &Value) -> HashMap<String, Value> {
    let mut loop_ctx = ctx.to_template_context();

    for section in ["work", "workload", "input"] {
        if let Some(Value::Object(map)) = ctx.get(section) {
            for (k, v) in map {
                loop_ctx.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
    }

    if let Value::Object(map) = task_with {
        for (k, v) in map {
            loop_ctx.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    loop_ctx
}

/// Candidate keys derived from the element name.
fn candidate_keys(element: &str) -> Vec<String> {
    vec![
        element.to_string(),
        format!("{}s", element),
        format!("{}_list", element),
        format!("{}_items", element),
        "items".to_string(),
        "values".to_string(),
        "collection".to_string(),
    ]
}

/// Look up a collection from with-params or the context data sections.
fn lookup_collection_fallback(
    element: &str,
    task_with: &Value,
    ctx: &ExecutionContext,
) -> Option<Value> {
    let keys = candidate_keys(element);

    if let Some(found) = extract_from_mapping(task_with, &keys) {
        return Some(found);
    }

    for section in ["data", "input", "work"] {
        if let Some(section_value) = ctx.get(section) {
            if let Some(found) = extract_from_mapping(section_value, &keys) {
                return Some(found);
            }
        }
    }
    None
}

/// Pull a collection out of a mapping by candidate keys; a single-entry map
/// yields its sole value.
fn extract_from_mapping(mapping: &Value, keys: &[String]) -> Option<Value> {
    let Value::Object(map) = mapping else {
        return None;
    };
    for key in keys {
        if let Some(value) = map.get(key) {
            if !value.is_null() {
                return Some(value.clone());
            }
        }
    }
    if map.len() == 1 {
        return map.values().next().cloned();
    }
    None
}

/// Coerce a resolved collection value to a sequence.
fn coerce_items(value: Value) -> Result<Vec<Value>, ToolError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| serde_json::json!({"key": k, "value": v}))
            .collect()),
        Value::String(s) => {
            if let Ok(items) = serde_json::from_str::<Vec<Value>>(&s) {
                return Ok(items);
            }
            Ok(s.split([',', '\n'])
                .map(|part| part.trim())
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect())
        }
        Value::Number(n) => {
            let count = n.as_u64().unwrap_or(0);
            Ok((0..count).map(|i| serde_json::json!(i)).collect())
        }
        other => Err(ToolError::Iterator(format!(
            "collection did not resolve to an iterable: {}",
            other
        ))),
    }
}

/// Order keys: numbers numerically, otherwise by string form.
fn compare_keys(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthResolver, MemoryCredentialSource};
    use crate::event::MemoryEmitter;
    use crate::tools::{CodeTool, HttpTool, MockTransport};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    struct Harness {
        controller: IteratorController,
        emitter: Arc<MemoryEmitter>,
    }

    fn harness() -> Harness {
        let resolver = Arc::new(AuthResolver::new(Arc::new(MemoryCredentialSource::new())));
        let http = Arc::new(HttpTool::with_mock(
            Arc::clone(&resolver),
            Arc::new(MockTransport::with_defaults()),
        ));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CodeTool::new()));
        registry.register(http.clone() as Arc<dyn crate::registry::Tool>);

        let sink = Arc::new(SinkExecutor::new(Arc::clone(&resolver), Arc::clone(&http)));
        let emitter = Arc::new(MemoryEmitter::new());

        Harness {
            controller: IteratorController::new(
                Arc::new(registry),
                sink,
                emitter.clone() as Arc<dyn EventEmitter>,
                http,
            ),
            emitter,
        }
    }

    fn echo_task() -> Value {
        let code = BASE64.encode("fn main(input_data) { input_data.item }");
        serde_json::json!({"tool": "python", "code": code})
    }

    fn loop_spec(extra: Value) -> LoopSpec {
        let mut config = serde_json::json!({
            "element": "item",
            "task": echo_task(),
        });
        if let (Some(base), Some(ext)) = (config.as_object_mut(), extra.as_object()) {
            for (k, v) in ext {
                base.insert(k.clone(), v.clone());
            }
        }
        LoopSpec::parse(&config).unwrap()
    }

    #[tokio::test]
    async fn test_sequential_iteration_order() {
        let h = harness();
        let spec = loop_spec(serde_json::json!({"collection": [10, 20, 30]}));
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(&spec, &ctx, &serde_json::json!({}), "numbers")
            .await
            .unwrap();

        assert_eq!(outcome.status, ToolStatus::Success);
        assert_eq!(
            outcome.data,
            vec![
                serde_json::json!(10),
                serde_json::json!(20),
                serde_json::json!(30)
            ]
        );

        let types = h.emitter.event_types();
        assert_eq!(types.first().map(String::as_str), Some("iterator_started"));
        assert_eq!(types.last().map(String::as_str), Some("iterator_completed"));
        assert_eq!(
            types.iter().filter(|t| *t == "iteration_completed").count(),
            3
        );
    }

    #[tokio::test]
    async fn test_where_and_order_by() {
        let h = harness();
        let spec = loop_spec(serde_json::json!({
            "collection": [3, 1, 2, 4],
            "where": "{{ item % 2 == 0 }}",
            "order_by": "{{ -item }}"
        }));
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(&spec, &ctx, &serde_json::json!({}), "evens")
            .await
            .unwrap();

        assert_eq!(
            outcome.data,
            vec![serde_json::json!(4), serde_json::json!(2)]
        );
        // two filtered items recorded
        let types = h.emitter.event_types();
        assert_eq!(
            types.iter().filter(|t| *t == "iteration_filtered").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_parallel_preserves_logical_order() {
        let h = harness();
        let spec = loop_spec(serde_json::json!({
            "collection": [1, 2, 3, 4, 5, 6],
            "mode": "async",
            "concurrency": 4
        }));
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(&spec, &ctx, &serde_json::json!({}), "par")
            .await
            .unwrap();

        assert_eq!(
            outcome.data,
            (1..=6).map(|n| serde_json::json!(n)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_limit_and_chunk() {
        let h = harness();
        let code = BASE64.encode("fn main(input_data) { input_data.item.len() }");
        let spec = loop_spec(serde_json::json!({
            "collection": [1, 2, 3, 4, 5],
            "limit": 4,
            "chunk": 2,
            "task": {"tool": "python", "code": code}
        }));
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(&spec, &ctx, &serde_json::json!({}), "chunks")
            .await
            .unwrap();

        // 4 items in chunks of 2 -> two batches of length 2
        assert_eq!(
            outcome.data,
            vec![serde_json::json!(2), serde_json::json!(2)]
        );
    }

    #[tokio::test]
    async fn test_failed_iteration_collects_error_keeps_order() {
        let h = harness();
        let code = BASE64.encode(
            "fn main(input_data) { if input_data.item == 2 { throw \"bad item\" } input_data.item }",
        );
        let spec = loop_spec(serde_json::json!({
            "collection": [1, 2, 3],
            "task": {"tool": "python", "code": code}
        }));
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(&spec, &ctx, &serde_json::json!({}), "flaky")
            .await
            .unwrap();

        assert_eq!(outcome.status, ToolStatus::Error);
        assert_eq!(outcome.data.len(), 3);
        assert_eq!(outcome.data[0], serde_json::json!(1));
        assert_eq!(outcome.data[2], serde_json::json!(3));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0]["index"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_per_item_sink_attaches_save_meta() {
        let h = harness();
        let code = BASE64.encode("fn main(input_data) { #{\"id\": input_data.item} }");
        let spec = loop_spec(serde_json::json!({
            "collection": [{"id": 1}, {"id": 2}, {"id": 3}],
            "task": {
                "tool": "python",
                "code": code,
                "sink": {"storage": "event", "data": {"id": "{{ item.id }}"}}
            }
        }));
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(&spec, &ctx, &serde_json::json!({}), "sinked")
            .await
            .unwrap();

        assert_eq!(outcome.status, ToolStatus::Success);
        for result in &outcome.data {
            assert_eq!(
                result["save_meta"]["storage_kind"],
                serde_json::json!("event")
            );
        }
        let types = h.emitter.event_types();
        assert_eq!(
            types.iter().filter(|t| *t == "save_completed").count(),
            3
        );
    }

    #[tokio::test]
    async fn test_collection_fallback_from_with_params() {
        let h = harness();
        let mut config = serde_json::json!({"element": "item", "task": echo_task()});
        config.as_object_mut().map(|m| m.remove("collection"));
        let spec = LoopSpec::parse(&config).unwrap();
        let ctx = ExecutionContext::new(1, serde_json::json!({}));

        let outcome = h
            .controller
            .run(
                &spec,
                &ctx,
                &serde_json::json!({"items": [7, 8]}),
                "fallback",
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.data,
            vec![serde_json::json!(7), serde_json::json!(8)]
        );
    }

    #[test]
    fn test_coerce_items_shapes() {
        assert_eq!(coerce_items(serde_json::json!([1, 2])).unwrap().len(), 2);
        assert_eq!(coerce_items(serde_json::json!(3)).unwrap().len(), 3);
        assert_eq!(
            coerce_items(serde_json::json!("a, b\nc")).unwrap(),
            vec![
                serde_json::json!("a"),
                serde_json::json!("b"),
                serde_json::json!("c")
            ]
        );
        let pairs = coerce_items(serde_json::json!({"x": 1})).unwrap();
        assert_eq!(pairs[0]["key"], serde_json::json!("x"));
        assert!(coerce_items(serde_json::json!(true)).is_err());
    }

    #[test]
    fn test_candidate_keys() {
        let keys = candidate_keys("city");
        assert!(keys.contains(&"city".to_string()));
        assert!(keys.contains(&"citys".to_string()));
        assert!(keys.contains(&"city_list".to_string()));
        assert!(keys.contains(&"items".to_string()));
    }

    #[test]
    fn test_loop_spec_defaults() {
        let spec = LoopSpec::parse(&serde_json::json!({"collection": []})).unwrap();
        assert_eq!(spec.element, "item");
        assert_eq!(spec.mode, IterMode::Sequential);
        assert_eq!(spec.concurrency, DEFAULT_CONCURRENCY);
        assert!(!spec.enumerate);
    }
}
