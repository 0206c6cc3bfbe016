//! Execution status endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /executions?limit=...`: recent executions, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let executions = state.executions.list(query.limit).await?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

/// `GET /executions/{execution_id}`: summary plus the ordered event list.
pub async fn get(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let detail = state.executions.detail(execution_id).await?;
    Ok(Json(serde_json::to_value(detail)?))
}
