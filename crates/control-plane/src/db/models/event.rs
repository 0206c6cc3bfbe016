//! Event log record.
//!
//! One row per observable engine action. `event_id` is assigned by the log
//! and is unique and ordered within an `execution_id`; appends are
//! idempotent on `(execution_id, event_id)`.

use chrono::{DateTime, Utc};
use noetl_tools::event::{EventDraft, LoopState};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Durable event record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventRecord {
    /// Execution identifier.
    pub execution_id: i64,

    /// Ordered event identifier within the execution.
    pub event_id: i64,

    /// Parent event for hierarchy.
    pub parent_event_id: Option<i64>,

    /// Event type string (see `noetl_tools::event::EventType`).
    pub event_type: String,

    /// Node identifier.
    pub node_id: Option<String>,

    /// Node name (step, task, loop).
    pub node_name: Option<String>,

    /// Node type (step, task, iterator, iteration, sink, execution).
    pub node_type: Option<String>,

    /// Event status.
    pub status: String,

    /// Duration in milliseconds, for completion events.
    pub duration_ms: Option<i64>,

    /// Context snapshot minus private keys.
    pub input_context: Option<serde_json::Value>,

    /// Result payload.
    pub output_result: Option<serde_json::Value>,

    /// Free-form metadata.
    pub metadata: Option<serde_json::Value>,

    /// Error message, for failure events.
    pub error: Option<String>,

    /// Loop identifier, for iterator/iteration events.
    pub loop_id: Option<String>,

    /// Loop name.
    pub loop_name: Option<String>,

    /// Element variable name.
    pub iterator: Option<String>,

    /// The iterated collection.
    pub items: Option<serde_json::Value>,

    /// Logical index of the current iteration.
    pub current_index: Option<i64>,

    /// The current item.
    pub current_item: Option<serde_json::Value>,

    /// Aggregated loop results.
    pub results: Option<serde_json::Value>,

    /// Event timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Materialize a draft into a record with the assigned id and timestamp.
    pub fn from_draft(draft: EventDraft, event_id: i64) -> Self {
        let loop_state = draft.loop_state.unwrap_or_default();
        Self {
            execution_id: draft.execution_id,
            event_id,
            parent_event_id: draft.parent_event_id,
            event_type: draft.event_type.to_string(),
            node_id: draft.node_id,
            node_name: draft.node_name,
            node_type: draft.node_type,
            status: draft.status.to_string(),
            duration_ms: draft.duration_ms,
            input_context: draft.input_context,
            output_result: draft.output_result,
            metadata: draft.metadata,
            error: draft.error,
            loop_id: loop_state.loop_id,
            loop_name: loop_state.loop_name,
            iterator: loop_state.iterator,
            items: loop_state.items,
            current_index: loop_state.current_index,
            current_item: loop_state.current_item,
            results: loop_state.results,
            created_at: Utc::now(),
        }
    }

    /// The loop fields of this record, if any are set.
    pub fn loop_state(&self) -> Option<LoopState> {
        if self.loop_id.is_none() && self.loop_name.is_none() {
            return None;
        }
        Some(LoopState {
            loop_id: self.loop_id.clone(),
            loop_name: self.loop_name.clone(),
            iterator: self.iterator.clone(),
            items: self.items.clone(),
            current_index: self.current_index,
            current_item: self.current_item.clone(),
            results: self.results.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noetl_tools::event::{EventStatus, EventType};

    #[test]
    fn test_from_draft() {
        let draft = EventDraft::new(7, EventType::StepStart, EventStatus::InProgress)
            .with_node("fetch", "step");
        let record = EventRecord::from_draft(draft, 3);

        assert_eq!(record.execution_id, 7);
        assert_eq!(record.event_id, 3);
        assert_eq!(record.event_type, "step_start");
        assert_eq!(record.status, "in_progress");
        assert_eq!(record.node_name.as_deref(), Some("fetch"));
        assert!(record.loop_state().is_none());
    }

    #[test]
    fn test_loop_fields_roundtrip() {
        let draft = EventDraft::new(1, EventType::IterationCompleted, EventStatus::Success)
            .with_loop(LoopState {
                loop_id: Some("abc".to_string()),
                loop_name: Some("fan_out".to_string()),
                current_index: Some(2),
                ..Default::default()
            });
        let record = EventRecord::from_draft(draft, 10);

        let state = record.loop_state().unwrap();
        assert_eq!(state.loop_name.as_deref(), Some("fan_out"));
        assert_eq!(state.current_index, Some(2));
    }

    #[test]
    fn test_serialization_uses_iso_timestamps() {
        let draft = EventDraft::new(1, EventType::TaskStart, EventStatus::InProgress);
        let record = EventRecord::from_draft(draft, 1);
        let json = serde_json::to_string(&record).unwrap();
        // chrono serializes DateTime<Utc> as RFC 3339 / ISO-8601
        assert!(json.contains("created_at"));
        assert!(json.contains('T'));
    }
}
