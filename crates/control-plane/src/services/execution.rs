//! Execution status derived from the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::models::EventRecord;
use crate::engine::EventLog;
use crate::error::{AppError, AppResult};

/// Execution summary for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: i64,
    pub status: String,
    pub event_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Detailed execution view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub summary: ExecutionSummary,
    pub events: Vec<EventRecord>,
}

/// Derives execution state from the event log.
#[derive(Clone)]
pub struct ExecutionService {
    log: Arc<dyn EventLog>,
}

impl ExecutionService {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Roll an execution's events up into a summary.
    pub async fn summary(&self, execution_id: i64) -> AppResult<ExecutionSummary> {
        let events = self.log.by_execution(execution_id).await?;
        if events.is_empty() {
            return Err(AppError::NotFound(format!(
                "Execution '{}' not found",
                execution_id
            )));
        }
        Ok(summarize(execution_id, &events))
    }

    /// Full detail: summary plus the ordered event list.
    pub async fn detail(&self, execution_id: i64) -> AppResult<ExecutionDetail> {
        let events = self.log.by_execution(execution_id).await?;
        if events.is_empty() {
            return Err(AppError::NotFound(format!(
                "Execution '{}' not found",
                execution_id
            )));
        }
        Ok(ExecutionDetail {
            summary: summarize(execution_id, &events),
            events,
        })
    }

    /// Summaries of recent executions, newest first.
    pub async fn list(&self, limit: i64) -> AppResult<Vec<ExecutionSummary>> {
        let ids = self.log.executions(limit).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let events = self.log.by_execution(id).await?;
            if !events.is_empty() {
                summaries.push(summarize(id, &events));
            }
        }
        Ok(summaries)
    }
}

/// Status rollup: terminal events win, otherwise the execution is running.
fn summarize(execution_id: i64, events: &[EventRecord]) -> ExecutionSummary {
    let started_at = events
        .iter()
        .find(|e| e.event_type == "execution_start")
        .map(|e| e.created_at);

    let terminal = events
        .iter()
        .rev()
        .find(|e| matches!(e.event_type.as_str(), "execution_complete" | "execution_error"));

    let (status, completed_at) = match terminal {
        Some(e) if e.event_type == "execution_complete" => {
            ("completed".to_string(), Some(e.created_at))
        }
        Some(e) => ("failed".to_string(), Some(e.created_at)),
        None => ("running".to_string(), None),
    };

    ExecutionSummary {
        execution_id,
        status,
        event_count: events.len(),
        started_at,
        completed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEventLog;
    use noetl_tools::event::{EventDraft, EventStatus, EventType};

    async fn seeded_log() -> Arc<MemoryEventLog> {
        let log = Arc::new(MemoryEventLog::new());
        for (event_type, status) in [
            (EventType::ExecutionStart, EventStatus::InProgress),
            (EventType::StepStart, EventStatus::InProgress),
            (EventType::StepComplete, EventStatus::Success),
            (EventType::ExecutionComplete, EventStatus::Success),
        ] {
            log.append(EventDraft::new(42, event_type, status)).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_summary_completed() {
        let log = seeded_log().await;
        let service = ExecutionService::new(log as Arc<dyn EventLog>);

        let summary = service.summary(42).await.unwrap();
        assert_eq!(summary.status, "completed");
        assert_eq!(summary.event_count, 4);
        assert!(summary.started_at.is_some());
        assert!(summary.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_summary_running_without_terminal() {
        let log = Arc::new(MemoryEventLog::new());
        log.append(EventDraft::new(7, EventType::ExecutionStart, EventStatus::InProgress))
            .await
            .unwrap();
        let service = ExecutionService::new(log as Arc<dyn EventLog>);

        let summary = service.summary(7).await.unwrap();
        assert_eq!(summary.status, "running");
        assert!(summary.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let service = ExecutionService::new(Arc::new(MemoryEventLog::new()) as Arc<dyn EventLog>);
        let result = service.summary(999).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
