//! Event model and emitter contract.
//!
//! Every observable action of an execution is recorded as an event. Plugins,
//! the iterator controller, and the sink subsystem never touch storage
//! directly: they emit drafts through [`EventEmitter`] and the engine adapts
//! the emitter onto the durable event log, which assigns `event_id` and the
//! timestamp. Ordering by `event_id` within an execution reflects
//! happens-before.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::ToolError;

/// Event types recorded in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    ExecutionComplete,
    ExecutionError,
    StepStart,
    StepComplete,
    StepResult,
    StepError,
    StepTransition,
    TaskStart,
    TaskExecute,
    TaskComplete,
    TaskError,
    IteratorStarted,
    IteratorCompleted,
    IterationStarted,
    IterationCompleted,
    IterationFailed,
    IterationFiltered,
    SaveStarted,
    SaveCompleted,
    SaveFailed,
    ContextUpdate,
    LoopStart,
    LoopIteration,
    LoopComplete,
    #[serde(untagged)]
    Custom(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::ExecutionStart => "execution_start",
            EventType::ExecutionComplete => "execution_complete",
            EventType::ExecutionError => "execution_error",
            EventType::StepStart => "step_start",
            EventType::StepComplete => "step_complete",
            EventType::StepResult => "step_result",
            EventType::StepError => "step_error",
            EventType::StepTransition => "step_transition",
            EventType::TaskStart => "task_start",
            EventType::TaskExecute => "task_execute",
            EventType::TaskComplete => "task_complete",
            EventType::TaskError => "task_error",
            EventType::IteratorStarted => "iterator_started",
            EventType::IteratorCompleted => "iterator_completed",
            EventType::IterationStarted => "iteration_started",
            EventType::IterationCompleted => "iteration_completed",
            EventType::IterationFailed => "iteration_failed",
            EventType::IterationFiltered => "iteration_filtered",
            EventType::SaveStarted => "save_started",
            EventType::SaveCompleted => "save_completed",
            EventType::SaveFailed => "save_failed",
            EventType::ContextUpdate => "context_update",
            EventType::LoopStart => "loop_start",
            EventType::LoopIteration => "loop_iteration",
            EventType::LoopComplete => "loop_complete",
            EventType::Custom(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "execution_start" => EventType::ExecutionStart,
            "execution_complete" => EventType::ExecutionComplete,
            "execution_error" => EventType::ExecutionError,
            "step_start" => EventType::StepStart,
            "step_complete" => EventType::StepComplete,
            "step_result" => EventType::StepResult,
            "step_error" => EventType::StepError,
            "step_transition" => EventType::StepTransition,
            "task_start" => EventType::TaskStart,
            "task_execute" => EventType::TaskExecute,
            "task_complete" => EventType::TaskComplete,
            "task_error" => EventType::TaskError,
            "iterator_started" => EventType::IteratorStarted,
            "iterator_completed" => EventType::IteratorCompleted,
            "iteration_started" => EventType::IterationStarted,
            "iteration_completed" => EventType::IterationCompleted,
            "iteration_failed" => EventType::IterationFailed,
            "iteration_filtered" => EventType::IterationFiltered,
            "save_started" => EventType::SaveStarted,
            "save_completed" => EventType::SaveCompleted,
            "save_failed" => EventType::SaveFailed,
            "context_update" => EventType::ContextUpdate,
            "loop_start" => EventType::LoopStart,
            "loop_iteration" => EventType::LoopIteration,
            "loop_complete" => EventType::LoopComplete,
            other => EventType::Custom(other.to_string()),
        }
    }
}

/// Event status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    InProgress,
    Success,
    Error,
    Filtered,
    Created,
    Completed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::InProgress => "in_progress",
            EventStatus::Success => "success",
            EventStatus::Error => "error",
            EventStatus::Filtered => "filtered",
            EventStatus::Created => "created",
            EventStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Loop fields carried on iterator/iteration events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_name: Option<String>,

    /// Element variable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_index: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
}

/// An event before the log assigns `event_id` and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub execution_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,

    pub event_type: EventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,

    pub status: EventStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    /// Serialized context snapshot minus private keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_context: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
}

impl EventDraft {
    /// Create a minimal event draft.
    pub fn new(execution_id: i64, event_type: EventType, status: EventStatus) -> Self {
        Self {
            execution_id,
            parent_event_id: None,
            event_type,
            node_id: None,
            node_name: None,
            node_type: None,
            status,
            duration_ms: None,
            input_context: None,
            output_result: None,
            metadata: None,
            error: None,
            loop_state: None,
        }
    }

    pub fn with_node(
        mut self,
        name: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.node_id = Some(name.clone());
        self.node_name = Some(name);
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_parent(mut self, parent_event_id: i64) -> Self {
        self.parent_event_id = Some(parent_event_id);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.input_context = Some(context);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.output_result = Some(result);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_loop(mut self, loop_state: LoopState) -> Self {
        self.loop_state = Some(loop_state);
        self
    }
}

/// Emitter contract shared by plugins, the iterator, and the sink subsystem.
///
/// Emission failures are fatal for the current step; implementations must not
/// block longer than a single-row write.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Persist the event, returning the assigned `event_id`.
    async fn emit(&self, event: EventDraft) -> Result<i64, ToolError>;
}

/// In-memory emitter for tests and local worker runs.
#[derive(Default)]
pub struct MemoryEmitter {
    events: Mutex<Vec<EventDraft>>,
    next_id: AtomicI64,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all emitted events in emission order.
    pub fn events(&self) -> Vec<EventDraft> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Event types in emission order, for assertions.
    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.event_type.to_string())
            .collect()
    }
}

#[async_trait]
impl EventEmitter for MemoryEmitter {
    async fn emit(&self, event: EventDraft) -> Result<i64, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.events
            .lock()
            .map_err(|_| ToolError::Event("emitter poisoned".to_string()))?
            .push(event);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        assert_eq!(EventType::ExecutionStart.to_string(), "execution_start");
        assert_eq!(EventType::from("iteration_completed"), EventType::IterationCompleted);
        assert_eq!(
            EventType::from("something_else"),
            EventType::Custom("something_else".to_string())
        );
    }

    #[test]
    fn test_event_status_display() {
        assert_eq!(EventStatus::InProgress.to_string(), "in_progress");
        assert_eq!(EventStatus::Success.to_string(), "success");
        assert_eq!(EventStatus::Filtered.to_string(), "filtered");
    }

    #[test]
    fn test_draft_builder() {
        let draft = EventDraft::new(1, EventType::StepStart, EventStatus::InProgress)
            .with_node("fetch", "step")
            .with_parent(7)
            .with_result(serde_json::json!({"ok": true}));

        assert_eq!(draft.node_name.as_deref(), Some("fetch"));
        assert_eq!(draft.parent_event_id, Some(7));
        assert!(draft.output_result.is_some());
    }

    #[tokio::test]
    async fn test_memory_emitter_assigns_ordered_ids() {
        let emitter = MemoryEmitter::new();
        let a = emitter
            .emit(EventDraft::new(1, EventType::TaskStart, EventStatus::InProgress))
            .await
            .unwrap();
        let b = emitter
            .emit(EventDraft::new(1, EventType::TaskComplete, EventStatus::Success))
            .await
            .unwrap();

        assert!(b > a);
        assert_eq!(
            emitter.event_types(),
            vec!["task_start".to_string(), "task_complete".to_string()]
        );
    }

    #[test]
    fn test_draft_serialization_skips_unset() {
        let draft = EventDraft::new(5, EventType::TaskStart, EventStatus::InProgress);
        let json = serde_json::to_string(&draft).unwrap();
        assert!(json.contains("task_start"));
        assert!(!json.contains("loop_state"));
        assert!(!json.contains("error"));
    }
}
