//! Step interpreter.
//!
//! Executes one step: renders entry parameters, dispatches to the loop
//! controller, an `end_loop` aggregation, a workbook `call`, or a terminal,
//! applies the task's `return` transform, persists the `step_result` event,
//! and binds the output into the context.

use noetl_tools::event::{EventDraft, EventEmitter, EventStatus, EventType};
use noetl_tools::iter::{IteratorController, LoopSpec};
use noetl_tools::registry::{ToolConfig, ToolRegistry};
use noetl_tools::result::ToolStatus;
use noetl_tools::sink::SinkExecutor;
use noetl_tools::{ExecutionContext, TemplateEngine};
use serde_json::Value;
use std::sync::Arc;

use crate::engine::log::EventLog;
use crate::error::{AppError, AppResult};
use crate::playbook::{CallSpec, EndLoopSpec, Playbook, Step, StepBody};

/// Result of interpreting one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: ToolStatus,
    pub data: Value,
    pub error: Option<String>,

    /// Set by `loop` steps to chain into their matching `end_loop`.
    pub next_step_override: Option<String>,
}

impl StepOutcome {
    fn success(data: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            data,
            error: None,
            next_step_override: None,
        }
    }

    fn error(message: String, data: Value) -> Self {
        Self {
            status: ToolStatus::Error,
            data,
            error: Some(message),
            next_step_override: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Interprets individual workflow steps.
pub struct StepInterpreter {
    registry: Arc<ToolRegistry>,
    iterator: IteratorController,
    sink: Arc<SinkExecutor>,
    template: TemplateEngine,
    emitter: Arc<dyn EventEmitter>,
    log: Arc<dyn EventLog>,
}

impl StepInterpreter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        iterator: IteratorController,
        sink: Arc<SinkExecutor>,
        emitter: Arc<dyn EventEmitter>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            registry,
            iterator,
            sink,
            template: TemplateEngine::new(),
            emitter,
            log,
        }
    }

    /// Execute one step against the live context.
    pub async fn execute(
        &self,
        playbook: &Playbook,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> AppResult<StepOutcome> {
        // Entry parameters merge into the context before anything runs
        let step_with = match &step.with {
            Some(params) => {
                let rendered = self
                    .template
                    .render_value(params, &ctx.to_template_context())?;
                ctx.merge(&rendered);
                rendered
            }
            None => Value::Object(serde_json::Map::new()),
        };

        ctx.step = step.step.clone();

        self.emitter
            .emit(
                EventDraft::new(ctx.execution_id, EventType::StepStart, EventStatus::InProgress)
                    .with_node(&step.step, "step")
                    .with_context(ctx.sanitized_snapshot()),
            )
            .await
            .map_err(AppError::Tool)?;

        let mut outcome = match step.body() {
            StepBody::Terminal => StepOutcome::success(Value::Object(serde_json::Map::new())),
            StepBody::Call(call) => self.execute_call(playbook, step, call, ctx).await?,
            StepBody::Loop(spec) => self.execute_loop(playbook, step, spec, &step_with, ctx).await?,
            StepBody::EndLoop(spec) => self.execute_end_loop(spec, ctx).await?,
        };

        if outcome.is_success() {
            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::StepResult, EventStatus::Success)
                        .with_node(&step.step, "step")
                        .with_result(outcome.data.clone()),
                )
                .await
                .map_err(AppError::Tool)?;

            ctx.bind_step_result(&step.step, outcome.data.clone(), "success");

            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::StepComplete, EventStatus::Success)
                        .with_node(&step.step, "step"),
                )
                .await
                .map_err(AppError::Tool)?;
        } else {
            let message = outcome
                .error
                .clone()
                .unwrap_or_else(|| "step failed".to_string());
            ctx.bind_step_result(&step.step, outcome.data.clone(), "error");
            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::StepError, EventStatus::Error)
                        .with_node(&step.step, "step")
                        .with_error(message.clone())
                        .with_result(outcome.data.clone()),
                )
                .await
                .map_err(AppError::Tool)?;
            outcome.error = Some(message);
        }

        Ok(outcome)
    }

    /// Resolve and run a workbook task.
    async fn execute_call(
        &self,
        playbook: &Playbook,
        step: &Step,
        call: &CallSpec,
        ctx: &ExecutionContext,
    ) -> AppResult<StepOutcome> {
        let task = playbook.get_task(&call.name).ok_or_else(|| {
            AppError::Validation(format!(
                "Step '{}' calls unknown task '{}'",
                step.step, call.name
            ))
        })?;

        // Task-local scope with rendered call parameters
        let mut task_ctx = ctx.child_scope();
        let call_with = match &call.with {
            Some(params) => {
                let rendered = self
                    .template
                    .render_value(params, &ctx.to_template_context())?;
                task_ctx.merge(&rendered);
                rendered
            }
            None => Value::Object(serde_json::Map::new()),
        };

        // Workbook iterator tasks route to the loop controller
        if task.tool == "iterator" {
            let spec = LoopSpec::parse(&task.to_task_value())?;
            let outcome = self
                .iterator
                .run(&spec, &task_ctx, &call_with, &call.name)
                .await?;
            let data = outcome.to_value();
            return Ok(if outcome.errors.is_empty() {
                StepOutcome::success(data)
            } else {
                StepOutcome::error(
                    format!("{} iteration(s) failed", outcome.errors.len()),
                    data,
                )
            });
        }

        let (config, sink_spec, return_expr) = ToolConfig::from_task(&task.to_task_value())?;

        self.emitter
            .emit(
                EventDraft::new(ctx.execution_id, EventType::TaskStart, EventStatus::InProgress)
                    .with_node(&call.name, "task")
                    .with_context(task_ctx.sanitized_snapshot()),
            )
            .await
            .map_err(AppError::Tool)?;

        let result = self.registry.execute(&config, &task_ctx).await;

        if result.is_success() {
            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::TaskComplete, EventStatus::Success)
                        .with_node(&call.name, "task")
                        .with_duration(result.duration_ms.unwrap_or(0) as i64),
                )
                .await
                .map_err(AppError::Tool)?;
        } else {
            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::TaskError, EventStatus::Error)
                        .with_node(&call.name, "task")
                        .with_error(result.error.clone().unwrap_or_default())
                        .with_duration(result.duration_ms.unwrap_or(0) as i64),
                )
                .await
                .map_err(AppError::Tool)?;

            return Ok(StepOutcome::error(
                result.error.unwrap_or_else(|| "task failed".to_string()),
                result.data.unwrap_or(Value::Null),
            ));
        }

        let mut data = result.data.unwrap_or(Value::Null);

        // Task-level sink: failure is fatal for the step
        if let Some(ref sink_spec) = sink_spec {
            let mut sink_ctx = task_ctx.to_template_context();
            sink_ctx.insert("data".to_string(), data.clone());
            sink_ctx.insert("result".to_string(), data.clone());

            self.emitter
                .emit(
                    EventDraft::new(ctx.execution_id, EventType::SaveStarted, EventStatus::InProgress)
                        .with_node(&call.name, "sink"),
                )
                .await
                .map_err(AppError::Tool)?;

            match self.sink.execute(sink_spec, &sink_ctx).await {
                Ok(saved) => {
                    self.emitter
                        .emit(
                            EventDraft::new(
                                ctx.execution_id,
                                EventType::SaveCompleted,
                                EventStatus::Success,
                            )
                            .with_node(&call.name, "sink")
                            .with_result(saved.clone()),
                        )
                        .await
                        .map_err(AppError::Tool)?;
                    if let Value::Object(ref mut map) = data {
                        map.insert("save_meta".to_string(), saved["meta"].clone());
                    }
                }
                Err(e) => {
                    self.emitter
                        .emit(
                            EventDraft::new(ctx.execution_id, EventType::SaveFailed, EventStatus::Error)
                                .with_node(&call.name, "sink")
                                .with_error(e.to_string()),
                        )
                        .await
                        .map_err(AppError::Tool)?;
                    return Ok(StepOutcome::error(format!("sink failed: {}", e), data));
                }
            }
        }

        // Post-transform over the task result
        if let Some(ref return_expr) = return_expr {
            let mut transform_ctx = task_ctx.to_template_context();
            transform_ctx.insert("result".to_string(), data.clone());
            transform_ctx.insert("data".to_string(), data.clone());
            data = self.template.render_value(return_expr, &transform_ctx)?;
        }

        Ok(StepOutcome::success(data))
    }

    /// Delegate to the iterator controller.
    async fn execute_loop(
        &self,
        playbook: &Playbook,
        step: &Step,
        spec_value: &Value,
        step_with: &Value,
        ctx: &ExecutionContext,
    ) -> AppResult<StepOutcome> {
        let spec = LoopSpec::parse(spec_value)?;
        let outcome = self
            .iterator
            .run(&spec, ctx, step_with, &step.step)
            .await?;

        let next_step_override = playbook.end_loop_for(&step.step).map(|s| s.step.clone());

        let data = outcome.to_value();
        Ok(StepOutcome {
            status: outcome.status,
            error: if outcome.errors.is_empty() {
                None
            } else {
                Some(format!("{} iteration(s) failed", outcome.errors.len()))
            },
            data,
            next_step_override,
        })
    }

    /// Bind a finished loop's aggregated results into the context.
    async fn execute_end_loop(
        &self,
        spec: &EndLoopSpec,
        ctx: &mut ExecutionContext,
    ) -> AppResult<StepOutcome> {
        let loop_name = spec.loop_name();

        let record = self
            .log
            .latest_by_loop(ctx.execution_id, loop_name)
            .await?
            .ok_or_else(|| {
                AppError::Execution(format!("No events recorded for loop '{}'", loop_name))
            })?;

        let results = record.results.clone().unwrap_or(Value::Array(Vec::new()));
        ctx.set(format!("{}_results", loop_name), results.clone());

        let data = match spec.result() {
            Some(templates) => {
                let mut result_ctx = ctx.to_template_context();
                result_ctx.insert("results".to_string(), results.clone());
                let rendered = self.template.render_value(templates, &result_ctx)?;
                // bind aggregated values in the context
                ctx.merge(&rendered);
                rendered
            }
            None => results,
        };

        self.emitter
            .emit(
                EventDraft::new(ctx.execution_id, EventType::LoopComplete, EventStatus::Completed)
                    .with_node(loop_name, "iterator")
                    .with_metadata(serde_json::json!({"distributed_state": "completed"}))
                    .with_result(data.clone()),
            )
            .await
            .map_err(AppError::Tool)?;

        Ok(StepOutcome::success(data))
    }
}
