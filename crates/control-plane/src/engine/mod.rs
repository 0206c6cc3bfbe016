//! Execution engine.
//!
//! Loads a playbook, seeds the context from the workload, and runs the step
//! graph from `start` to `end`, delegating step bodies to the interpreter
//! and routing through the transition evaluator. Every action lands in the
//! event log; step results are derived back from it.

pub mod log;
pub mod step;
pub mod transition;

use async_trait::async_trait;
use noetl_tools::auth::{AuthResolver, CredentialSource};
use noetl_tools::event::{EventDraft, EventEmitter, EventStatus, EventType};
use noetl_tools::iter::IteratorController;
use noetl_tools::registry::ToolRegistry;
use noetl_tools::sink::SinkExecutor;
use noetl_tools::tools::{CodeTool, DuckdbTool, HttpTool, MockTransport, PostgresTool, TransferTool};
use noetl_tools::ExecutionContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::db::models::TransitionRecord;
use crate::error::{AppError, AppResult};
use crate::playbook::{parse_playbook, Playbook, END_STEP, START_STEP};

pub use log::{EventLog, LogEmitter, MemoryEventLog, PgEventLog};
pub use step::{StepInterpreter, StepOutcome};
pub use transition::{Transition, TransitionEvaluator};

/// Engine tuning knobs.
#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Bound on step transitions per execution (default 1000); guards
    /// control-flow cycles formed by revisiting step names.
    pub max_transitions: Option<usize>,

    /// Answer all HTTP requests from this mock transport.
    pub http_mock: Option<Arc<MockTransport>>,
}

/// Outcome of one engine run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionReport {
    pub execution_id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Successful step names mapped to their results.
    pub results: HashMap<String, Value>,
}

/// Source of playbooks for the engine.
#[async_trait]
pub trait PlaybookSource: Send + Sync {
    async fn load(&self, path: &str, version: Option<&str>) -> AppResult<Playbook>;
}

/// Filesystem-backed playbook source for local worker runs.
pub struct FilePlaybookSource;

#[async_trait]
impl PlaybookSource for FilePlaybookSource {
    async fn load(&self, path: &str, _version: Option<&str>) -> AppResult<Playbook> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::NotFound(format!("Playbook file '{}': {}", path, e)))?;
        parse_playbook(&content)
    }
}

static EXECUTION_COUNTER: AtomicI64 = AtomicI64::new(0);

/// Assign a time-ordered execution id.
pub fn next_execution_id() -> i64 {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = EXECUTION_COUNTER.fetch_add(1, Ordering::SeqCst) % 1000;
    millis * 1000 + seq
}

/// The top-level execution engine.
pub struct ExecutionEngine {
    playbook: Playbook,
    log: Arc<dyn EventLog>,
    interpreter: StepInterpreter,
    transitions: TransitionEvaluator,
    emitter: Arc<dyn EventEmitter>,
    max_transitions: usize,
}

impl ExecutionEngine {
    /// Build an engine with the full plugin registry.
    pub fn new(
        playbook: Playbook,
        log: Arc<dyn EventLog>,
        credentials: Arc<dyn CredentialSource>,
        options: EngineOptions,
    ) -> Self {
        let emitter: Arc<dyn EventEmitter> = Arc::new(LogEmitter::new(Arc::clone(&log)));
        let resolver = Arc::new(AuthResolver::new(credentials));

        let http = match options.http_mock {
            Some(mock) => Arc::new(HttpTool::with_mock(Arc::clone(&resolver), mock)),
            None => Arc::new(HttpTool::new(Arc::clone(&resolver))),
        };

        let mut registry = ToolRegistry::new();
        registry.register(Arc::clone(&http) as Arc<dyn noetl_tools::Tool>);
        registry.register(Arc::new(PostgresTool::new(Arc::clone(&resolver))));
        registry.register(Arc::new(DuckdbTool::new(Arc::clone(&resolver))));
        registry.register(Arc::new(CodeTool::new()));
        registry.register(Arc::new(TransferTool::new(Arc::clone(&resolver))));
        let registry = Arc::new(registry);

        let sink = Arc::new(SinkExecutor::new(Arc::clone(&resolver), Arc::clone(&http)));
        let iterator = IteratorController::new(
            Arc::clone(&registry),
            Arc::clone(&sink),
            Arc::clone(&emitter),
            Arc::clone(&http),
        );

        let interpreter = StepInterpreter::new(
            registry,
            iterator,
            sink,
            Arc::clone(&emitter),
            Arc::clone(&log),
        );

        Self {
            playbook,
            log,
            interpreter,
            transitions: TransitionEvaluator::new(),
            emitter,
            max_transitions: options.max_transitions.unwrap_or(1000),
        }
    }

    /// Run the playbook to completion.
    pub async fn run(
        &self,
        execution_id: i64,
        input_payload: Value,
    ) -> AppResult<ExecutionReport> {
        let started = std::time::Instant::now();

        // Merge the inbound payload over the playbook workload
        let mut workload = self
            .playbook
            .workload
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        if let (Some(base), Some(overlay)) = (workload.as_object_mut(), input_payload.as_object())
        {
            for (k, v) in overlay {
                base.insert(k.clone(), v.clone());
            }
        }

        let mut ctx = ExecutionContext::new(execution_id, workload.clone());

        self.emitter
            .emit(
                EventDraft::new(execution_id, EventType::ExecutionStart, EventStatus::InProgress)
                    .with_node(&self.playbook.name, "execution")
                    .with_context(serde_json::json!({
                        "path": self.playbook.path,
                        "workload": workload,
                    })),
            )
            .await
            .map_err(AppError::Tool)?;

        let mut current = START_STEP.to_string();
        let mut transitions_taken = 0usize;

        let failure = loop {
            let Some(step) = self.playbook.get_step(&current) else {
                break Some(format!("Step '{}' not found in workflow", current));
            };

            let outcome = self.interpreter.execute(&self.playbook, step, &mut ctx).await?;

            if !outcome.is_success() {
                break Some(
                    outcome
                        .error
                        .unwrap_or_else(|| format!("step '{}' failed", current)),
                );
            }

            if current == END_STEP {
                break None;
            }

            // A loop step chains straight into its end_loop
            let next = match outcome.next_step_override {
                Some(next_step) => Some(Transition {
                    to_step: next_step,
                    with_params: None,
                    condition: None,
                }),
                None => {
                    let candidates = self
                        .transitions
                        .evaluate(step, &ctx.to_template_context())?;
                    candidates.into_iter().next()
                }
            };

            let Some(transition) = next else {
                if step.next.is_empty() {
                    // terminal leaf without an explicit `end`
                    break None;
                }
                break Some(format!("No transition matched from step '{}'", current));
            };

            self.record_transition(execution_id, &current, &transition)
                .await?;

            if let Some(ref params) = transition.with_params {
                ctx.merge(params);
                self.emitter
                    .emit(
                        EventDraft::new(execution_id, EventType::ContextUpdate, EventStatus::Success)
                            .with_node(&transition.to_step, "step")
                            .with_result(params.clone()),
                    )
                    .await
                    .map_err(AppError::Tool)?;
            }

            transitions_taken += 1;
            if transitions_taken > self.max_transitions {
                break Some(format!(
                    "Transition bound exceeded ({} steps); aborting runaway workflow",
                    self.max_transitions
                ));
            }

            if transition.to_step == END_STEP && self.playbook.get_step(END_STEP).is_none() {
                // implicit terminal: no end step body to run
                break None;
            }

            current = transition.to_step;
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let status = match &failure {
            None => {
                self.emitter
                    .emit(
                        EventDraft::new(
                            execution_id,
                            EventType::ExecutionComplete,
                            EventStatus::Success,
                        )
                        .with_node(&self.playbook.name, "execution")
                        .with_duration(duration_ms),
                    )
                    .await
                    .map_err(AppError::Tool)?;
                "success".to_string()
            }
            Some(message) => {
                self.emitter
                    .emit(
                        EventDraft::new(execution_id, EventType::ExecutionError, EventStatus::Error)
                            .with_node(&self.playbook.name, "execution")
                            .with_error(message.clone())
                            .with_duration(duration_ms),
                    )
                    .await
                    .map_err(AppError::Tool)?;
                "error".to_string()
            }
        };

        let results = self.step_results(execution_id).await?;

        Ok(ExecutionReport {
            execution_id,
            status,
            error: failure,
            results,
        })
    }

    /// Map of successful step names to their results, from the event log.
    pub async fn step_results(&self, execution_id: i64) -> AppResult<HashMap<String, Value>> {
        let events = self.log.by_execution(execution_id).await?;
        let mut results = HashMap::new();
        for event in events {
            if event.event_type == "step_result" && event.status == "success" {
                if let (Some(name), Some(result)) = (event.node_name, event.output_result) {
                    results.insert(name, result);
                }
            }
        }
        Ok(results)
    }

    async fn record_transition(
        &self,
        execution_id: i64,
        from_step: &str,
        transition: &Transition,
    ) -> AppResult<()> {
        self.emitter
            .emit(
                EventDraft::new(execution_id, EventType::StepTransition, EventStatus::Success)
                    .with_node(from_step, "step")
                    .with_result(serde_json::json!({
                        "to_step": transition.to_step,
                        "condition": transition.condition,
                        "with": transition.with_params,
                    })),
            )
            .await
            .map_err(AppError::Tool)?;

        self.log
            .record_transition(TransitionRecord::new(
                execution_id,
                from_step,
                transition.to_step.clone(),
                transition.condition.clone(),
                transition.with_params.clone(),
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noetl_tools::auth::MemoryCredentialSource;
    use noetl_tools::tools::MockResponse;

    fn engine_for(yaml: &str, mock: Arc<MockTransport>) -> (ExecutionEngine, Arc<MemoryEventLog>) {
        let playbook = parse_playbook(yaml).unwrap();
        let log = Arc::new(MemoryEventLog::new());
        let engine = ExecutionEngine::new(
            playbook,
            Arc::clone(&log) as Arc<dyn EventLog>,
            Arc::new(MemoryCredentialSource::new()),
            EngineOptions {
                max_transitions: None,
                http_mock: Some(mock),
            },
        );
        (engine, log)
    }

    const LINEAR: &str = r#"
name: weather
path: examples/weather
workload:
  city: Bergen
workflow:
  - step: start
    next: [fetch]
  - step: fetch
    call:
      name: get_weather
      with:
        q: "{{ city }}"
    next: [save]
  - step: save
    call:
      name: persist
      with:
        value: "{{ fetch.result.data.max_temp }}"
    next: [end]
  - step: end
workbook:
  - name: get_weather
    tool: http
    endpoint: "http://api.local/forecast?q={{ q }}"
    method: GET
  - name: persist
    tool: python
    code: "fn main(input_data) { #{\"saved\": input_data.value} }"
    args:
      value: "{{ value }}"
"#;

    #[tokio::test]
    async fn test_linear_playbook_runs_to_end() {
        let (engine, log) = engine_for(LINEAR, Arc::new(MockTransport::with_defaults()));
        let report = engine.run(100, serde_json::json!({})).await.unwrap();

        assert_eq!(report.status, "success");
        assert_eq!(
            report.results["fetch"]["data"]["max_temp"],
            serde_json::json!(30)
        );
        assert_eq!(
            report.results["save"]["saved"],
            serde_json::json!(30)
        );

        // event ordering: execution_start first, execution_complete last,
        // step_start before step_complete per step
        let events = log.by_execution(100).await.unwrap();
        assert_eq!(events.first().unwrap().event_type, "execution_start");
        assert_eq!(events.last().unwrap().event_type, "execution_complete");
        let step_result_count = events
            .iter()
            .filter(|e| e.event_type == "step_result")
            .count();
        assert_eq!(step_result_count, 4);

        for step in ["start", "fetch", "save", "end"] {
            let start_idx = events
                .iter()
                .position(|e| {
                    e.event_type == "step_start" && e.node_name.as_deref() == Some(step)
                })
                .unwrap();
            let complete_idx = events
                .iter()
                .position(|e| {
                    e.event_type == "step_complete" && e.node_name.as_deref() == Some(step)
                })
                .unwrap();
            assert!(start_idx < complete_idx);
        }

        // transitions recorded
        assert_eq!(log.transitions().len(), 3);
    }

    #[tokio::test]
    async fn test_conditional_branching() {
        let yaml = r#"
name: branching
workload:
  threshold: 20
workflow:
  - step: start
    next: [check]
  - step: check
    call:
      name: measure
    next:
      - when: "{{ check.result.value > threshold }}"
        then: [hot]
        else: [cold]
  - step: hot
    next: [end]
  - step: cold
    next: [end]
  - step: end
workbook:
  - name: measure
    tool: python
    code: "fn main() { #{\"value\": 30} }"
"#;
        let (engine, log) = engine_for(yaml, Arc::new(MockTransport::new()));
        let report = engine.run(101, serde_json::json!({})).await.unwrap();

        assert_eq!(report.status, "success");
        assert!(report.results.contains_key("hot"));
        assert!(!report.results.contains_key("cold"));

        let transitions = log.transitions();
        let taken: Vec<&str> = transitions.iter().map(|t| t.to_step.as_str()).collect();
        assert!(taken.contains(&"hot"));
    }

    #[tokio::test]
    async fn test_loop_chains_to_end_loop() {
        let yaml = r#"
name: loops
workload:
  numbers: [3, 1, 2, 4]
workflow:
  - step: start
    next: [fan_out]
  - step: fan_out
    loop:
      collection: "{{ numbers }}"
      element: item
      where: "{{ item % 2 == 0 }}"
      order_by: "{{ -item }}"
      task:
        tool: python
        code: "fn main(input_data) { input_data.item * 10 }"
    next: [collect]
  - step: collect
    end_loop:
      loop: fan_out
    next: [end]
  - step: end
"#;
        let (engine, log) = engine_for(yaml, Arc::new(MockTransport::new()));
        let report = engine.run(102, serde_json::json!({})).await.unwrap();

        assert_eq!(report.status, "success");
        // post-filter-and-sort order: [4, 2] -> [40, 20]
        assert_eq!(
            report.results["fan_out"]["data"],
            serde_json::json!([40, 20])
        );
        assert_eq!(report.results["collect"], serde_json::json!([40, 20]));

        let events = log.by_execution(102).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "iterator_completed"));
        assert!(events.iter().any(|e| e.event_type == "loop_complete"));
    }

    #[tokio::test]
    async fn test_loop_with_per_item_sink() {
        let yaml = r#"
name: sinked_loop
workload:
  rows: [{"id": 1}, {"id": 2}, {"id": 3}]
workflow:
  - step: start
    next: [insert_all]
  - step: insert_all
    loop:
      collection: "{{ rows }}"
      element: row
      task:
        tool: python
        code: "fn main(input_data) { #{\"id\": input_data.row.id} }"
        sink:
          storage: event
          data:
            id: "{{ row.id }}"
    next: [end]
  - step: end
"#;
        let (engine, log) = engine_for(yaml, Arc::new(MockTransport::new()));
        let report = engine.run(106, serde_json::json!({})).await.unwrap();

        assert_eq!(report.status, "success");
        let data = &report.results["insert_all"]["data"];
        assert_eq!(data.as_array().unwrap().len(), 3);
        for (i, item) in data.as_array().unwrap().iter().enumerate() {
            assert_eq!(item["id"], serde_json::json!(i + 1));
            assert!(item["save_meta"].is_object());
        }

        let events = log.by_execution(106).await.unwrap();
        let completed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "iteration_completed")
            .collect();
        assert_eq!(completed.len(), 3);
        let indices: Vec<i64> = completed.iter().filter_map(|e| e.current_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(
            events.iter().filter(|e| e.event_type == "save_completed").count(),
            3
        );
    }

    #[tokio::test]
    async fn test_paginated_loop_step() {
        let mock = Arc::new(MockTransport::new());
        mock.register(
            r"/pages",
            vec![
                MockResponse::ok(serde_json::json!({"items": [1, 2], "next": 2})),
                MockResponse::ok(serde_json::json!({"items": [3, 4], "next": null})),
            ],
        );

        let yaml = r#"
name: paging
workflow:
  - step: start
    next: [fetch_all]
  - step: fetch_all
    loop:
      task:
        tool: http
        endpoint: "http://api.local/pages"
        method: GET
        params:
          page: 1
      pagination:
        continue_while: "{{ response.data.next != none }}"
        merge_strategy: extend
        merge_path: data.items
        next_page:
          params:
            page: "{{ response.data.next }}"
    next: [end]
  - step: end
"#;
        let (engine, _log) = engine_for(yaml, mock);
        let report = engine.run(107, serde_json::json!({})).await.unwrap();

        assert_eq!(report.status, "success");
        assert_eq!(
            report.results["fetch_all"]["data"],
            serde_json::json!([1, 2, 3, 4])
        );
    }

    #[tokio::test]
    async fn test_step_error_stops_execution() {
        let yaml = r#"
name: failing
workflow:
  - step: start
    next: [broken]
  - step: broken
    call:
      name: boom
    next: [unreached]
  - step: unreached
    next: [end]
  - step: end
workbook:
  - name: boom
    tool: python
    code: "fn main() { throw \"kaboom\" }"
"#;
        let (engine, log) = engine_for(yaml, Arc::new(MockTransport::new()));
        let report = engine.run(103, serde_json::json!({})).await.unwrap();

        assert_eq!(report.status, "error");
        assert!(report.error.unwrap().contains("kaboom"));
        assert!(!report.results.contains_key("unreached"));

        let events = log.by_execution(103).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "execution_error");
        assert!(events.iter().any(|e| e.event_type == "step_error"));
        assert!(events.iter().any(|e| e.event_type == "task_error"));
    }

    #[tokio::test]
    async fn test_transition_bound_stops_cycles() {
        let yaml = r#"
name: infinite
workflow:
  - step: start
    next: [spin]
  - step: spin
    next: [spin]
"#;
        let playbook = parse_playbook(yaml).unwrap();
        let log = Arc::new(MemoryEventLog::new());
        let engine = ExecutionEngine::new(
            playbook,
            Arc::clone(&log) as Arc<dyn EventLog>,
            Arc::new(MemoryCredentialSource::new()),
            EngineOptions {
                max_transitions: Some(10),
                http_mock: Some(Arc::new(MockTransport::new())),
            },
        );

        let report = engine.run(104, serde_json::json!({})).await.unwrap();
        assert_eq!(report.status, "error");
        assert!(report.error.unwrap().contains("bound"));
    }

    #[tokio::test]
    async fn test_input_payload_overrides_workload() {
        let (engine, _log) = engine_for(LINEAR, {
            let mock = Arc::new(MockTransport::new());
            mock.register(
                r"q=Oslo",
                vec![MockResponse::ok(serde_json::json!({"max_temp": 12}))],
            );
            mock
        });

        let report = engine
            .run(105, serde_json::json!({"city": "Oslo"}))
            .await
            .unwrap();
        assert_eq!(report.status, "success");
        assert_eq!(
            report.results["fetch"]["data"]["max_temp"],
            serde_json::json!(12)
        );
    }

    #[test]
    fn test_execution_ids_are_increasing() {
        let a = next_execution_id();
        let b = next_execution_id();
        assert!(b > a);
    }
}
