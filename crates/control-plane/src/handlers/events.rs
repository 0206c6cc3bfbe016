//! Event retrieval endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub execution_id: i64,
    pub event_type: Option<String>,
}

/// `GET /events?execution_id=...&event_type=...`: ordered event range.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let mut events = state.log.by_execution(query.execution_id).await?;
    if let Some(ref event_type) = query.event_type {
        events.retain(|e| &e.event_type == event_type);
    }
    Ok(Json(serde_json::json!({
        "execution_id": query.execution_id,
        "total": events.len(),
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
pub struct OneEventQuery {
    pub execution_id: i64,
}

/// `GET /events/{event_id}?execution_id=...`: one event.
pub async fn get(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
    Query(query): Query<OneEventQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let event = state
        .log
        .by_event(query.execution_id, event_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Event {} not found in execution {}",
                event_id, query.execution_id
            ))
        })?;
    Ok(Json(serde_json::to_value(event)?))
}
