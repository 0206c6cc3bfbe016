//! Event log store.
//!
//! The engine depends only on append/range/filter operations; storage is
//! PostgreSQL in the server and in-memory for tests and local worker runs.
//! `append` assigns an ordered `event_id` unique within the execution and
//! stamps the record; re-appending an existing id updates in place.

use async_trait::async_trait;
use noetl_tools::event::{EventDraft, EventEmitter};
use noetl_tools::ToolError;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::db::models::{EventRecord, TransitionRecord};
use crate::db::queries::{event as event_queries, transition as transition_queries};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};

/// Append-only, ordered store of execution events.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a draft, assigning the next `event_id` for its execution.
    async fn append(&self, draft: EventDraft) -> AppResult<i64>;

    /// All events of an execution ordered by `event_id`.
    async fn by_execution(&self, execution_id: i64) -> AppResult<Vec<EventRecord>>;

    /// One event by `(execution_id, event_id)`.
    async fn by_event(&self, execution_id: i64, event_id: i64)
        -> AppResult<Option<EventRecord>>;

    /// The last event carrying the given loop name.
    async fn latest_by_loop(
        &self,
        execution_id: i64,
        loop_name: &str,
    ) -> AppResult<Option<EventRecord>>;

    /// Record a taken transition for offline analysis.
    async fn record_transition(&self, record: TransitionRecord) -> AppResult<()>;

    /// Distinct execution ids, newest first.
    async fn executions(&self, limit: i64) -> AppResult<Vec<i64>>;
}

/// In-memory event log for tests and `noetl worker` local runs.
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<HashMap<i64, Vec<EventRecord>>>,
    transitions: Mutex<Vec<TransitionRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded transitions, for assertions.
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, draft: EventDraft) -> AppResult<i64> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| AppError::Internal("event log poisoned".to_string()))?;
        let stream = events.entry(draft.execution_id).or_default();
        let event_id = stream.len() as i64 + 1;
        stream.push(EventRecord::from_draft(draft, event_id));
        Ok(event_id)
    }

    async fn by_execution(&self, execution_id: i64) -> AppResult<Vec<EventRecord>> {
        Ok(self
            .events
            .lock()
            .map_err(|_| AppError::Internal("event log poisoned".to_string()))?
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn by_event(
        &self,
        execution_id: i64,
        event_id: i64,
    ) -> AppResult<Option<EventRecord>> {
        Ok(self
            .by_execution(execution_id)
            .await?
            .into_iter()
            .find(|e| e.event_id == event_id))
    }

    async fn latest_by_loop(
        &self,
        execution_id: i64,
        loop_name: &str,
    ) -> AppResult<Option<EventRecord>> {
        Ok(self
            .by_execution(execution_id)
            .await?
            .into_iter()
            .rev()
            .find(|e| e.loop_name.as_deref() == Some(loop_name)))
    }

    async fn record_transition(&self, record: TransitionRecord) -> AppResult<()> {
        self.transitions
            .lock()
            .map_err(|_| AppError::Internal("event log poisoned".to_string()))?
            .push(record);
        Ok(())
    }

    async fn executions(&self, limit: i64) -> AppResult<Vec<i64>> {
        let events = self
            .events
            .lock()
            .map_err(|_| AppError::Internal("event log poisoned".to_string()))?;
        let mut ids: Vec<(i64, chrono::DateTime<chrono::Utc>)> = events
            .iter()
            .filter_map(|(id, stream)| stream.first().map(|e| (*id, e.created_at)))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(ids
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(id, _)| id)
            .collect())
    }
}

/// Attempts at claiming an event id before giving up.
const ID_ASSIGN_RETRIES: usize = 5;

/// PostgreSQL-backed event log.
#[derive(Clone)]
pub struct PgEventLog {
    pool: DbPool,
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.is_unique_violation()
    )
}

impl PgEventLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, draft: EventDraft) -> AppResult<i64> {
        let execution_id = draft.execution_id;

        // Parallel iterations race on id assignment; take a fresh id and
        // retry on a unique violation.
        let mut last_error = None;
        for _ in 0..ID_ASSIGN_RETRIES {
            let event_id = event_queries::next_event_id(&self.pool, execution_id).await?;
            let record = EventRecord::from_draft(draft.clone(), event_id);
            match event_queries::insert_event(&self.pool, &record).await {
                Ok(id) => return Ok(id),
                Err(AppError::Database(e)) if is_unique_violation(&e) => {
                    last_error = Some(AppError::Database(e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::Internal(format!(
                "could not assign an event id for execution {}",
                execution_id
            ))
        }))
    }

    async fn by_execution(&self, execution_id: i64) -> AppResult<Vec<EventRecord>> {
        event_queries::by_execution(&self.pool, execution_id).await
    }

    async fn by_event(
        &self,
        execution_id: i64,
        event_id: i64,
    ) -> AppResult<Option<EventRecord>> {
        event_queries::by_event(&self.pool, execution_id, event_id).await
    }

    async fn latest_by_loop(
        &self,
        execution_id: i64,
        loop_name: &str,
    ) -> AppResult<Option<EventRecord>> {
        event_queries::latest_by_loop(&self.pool, execution_id, loop_name).await
    }

    async fn record_transition(&self, record: TransitionRecord) -> AppResult<()> {
        transition_queries::insert_transition(&self.pool, &record).await
    }

    async fn executions(&self, limit: i64) -> AppResult<Vec<i64>> {
        event_queries::list_executions(&self.pool, limit).await
    }
}

/// Adapter exposing an [`EventLog`] as the emitter plugins expect.
pub struct LogEmitter {
    log: Arc<dyn EventLog>,
}

impl LogEmitter {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventEmitter for LogEmitter {
    async fn emit(&self, event: EventDraft) -> Result<i64, ToolError> {
        self.log
            .append(event)
            .await
            .map_err(|e| ToolError::Event(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noetl_tools::event::{EventStatus, EventType, LoopState};

    #[tokio::test]
    async fn test_memory_log_orders_event_ids() {
        let log = MemoryEventLog::new();

        let first = log
            .append(EventDraft::new(1, EventType::ExecutionStart, EventStatus::InProgress))
            .await
            .unwrap();
        let second = log
            .append(EventDraft::new(1, EventType::StepStart, EventStatus::InProgress))
            .await
            .unwrap();
        // a second execution has its own sequence
        let other = log
            .append(EventDraft::new(2, EventType::ExecutionStart, EventStatus::InProgress))
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(other, 1);

        let events = log.by_execution(1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].event_id < events[1].event_id);
    }

    #[tokio::test]
    async fn test_latest_by_loop() {
        let log = MemoryEventLog::new();

        for (event_type, results) in [
            (EventType::IteratorStarted, None),
            (EventType::IteratorCompleted, Some(serde_json::json!([1, 2]))),
        ] {
            log.append(
                EventDraft::new(5, event_type, EventStatus::Success).with_loop(LoopState {
                    loop_name: Some("fan_out".to_string()),
                    results,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        }

        let latest = log.latest_by_loop(5, "fan_out").await.unwrap().unwrap();
        assert_eq!(latest.event_type, "iterator_completed");
        assert_eq!(latest.results, Some(serde_json::json!([1, 2])));

        assert!(log.latest_by_loop(5, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_by_event() {
        let log = MemoryEventLog::new();
        log.append(EventDraft::new(9, EventType::TaskStart, EventStatus::InProgress))
            .await
            .unwrap();

        assert!(log.by_event(9, 1).await.unwrap().is_some());
        assert!(log.by_event(9, 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_emitter_adapts() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let emitter = LogEmitter::new(Arc::clone(&log));

        let id = emitter
            .emit(EventDraft::new(3, EventType::TaskStart, EventStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(log.by_execution(3).await.unwrap().len(), 1);
    }
}
