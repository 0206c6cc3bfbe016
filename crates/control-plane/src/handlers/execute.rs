//! Execution launch endpoints.

use axum::extract::State;
use axum::Json;
use noetl_tools::event::{EventDraft, EventStatus, EventType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::{next_execution_id, EngineOptions, ExecutionEngine, PlaybookSource};
use crate::error::AppResult;
use crate::state::AppState;

/// Request body for both launch endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub path: String,

    #[serde(default)]
    pub version: Option<String>,

    /// Values merged over the playbook workload.
    #[serde(default, alias = "input", alias = "payload")]
    pub input_payload: Option<serde_json::Value>,

    /// Merge the payload into the workload (default) instead of replacing it.
    #[serde(default = "default_merge")]
    pub merge: bool,
}

fn default_merge() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub status: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ExecuteAsyncResponse {
    pub execution_id: String,
    pub event_id: i64,
    pub status: String,
}

fn build_engine(state: &AppState, playbook: crate::playbook::Playbook) -> ExecutionEngine {
    let options = EngineOptions {
        max_transitions: Some(state.config.max_transitions),
        http_mock: if state.config.http_mock_local {
            Some(Arc::new(noetl_tools::tools::MockTransport::with_defaults()))
        } else {
            None
        },
    };

    ExecutionEngine::new(
        playbook,
        Arc::clone(&state.log),
        Arc::new(state.credentials.clone()),
        options,
    )
}

/// Apply the request's merge semantics: merged payloads overlay the
/// workload inside the engine; non-merged payloads replace it outright.
fn apply_payload(
    playbook: &mut crate::playbook::Playbook,
    request: &ExecuteRequest,
) -> serde_json::Value {
    let payload = request
        .input_payload
        .clone()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

    if request.merge {
        payload
    } else {
        playbook.workload = Some(payload);
        serde_json::Value::Object(serde_json::Map::new())
    }
}

/// `POST /agent/execute`: run a playbook synchronously.
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let mut playbook = state
        .catalog
        .load(&request.path, request.version.as_deref())
        .await?;
    let payload = apply_payload(&mut playbook, &request);

    let execution_id = next_execution_id();
    let engine = build_engine(&state, playbook);
    let report = engine.run(execution_id, payload).await?;

    Ok(Json(ExecuteResponse {
        execution_id: execution_id.to_string(),
        status: report.status,
        result: serde_json::to_value(report.results)?,
    }))
}

/// `POST /agent/execute-async`: enqueue and return immediately.
pub async fn execute_async(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteAsyncResponse>> {
    let mut playbook = state
        .catalog
        .load(&request.path, request.version.as_deref())
        .await?;
    let payload = apply_payload(&mut playbook, &request);

    let execution_id = next_execution_id();

    // Mark the execution queued so the caller can poll the log immediately
    let event_id = state
        .log
        .append(
            EventDraft::new(
                execution_id,
                EventType::Custom("execution_queued".to_string()),
                EventStatus::Created,
            )
            .with_node(&request.path, "execution"),
        )
        .await?;

    let engine = build_engine(&state, playbook);
    tokio::spawn(async move {
        if let Err(e) = engine.run(execution_id, payload).await {
            tracing::error!(execution_id, error = %e, "Queued execution failed");
        }
    });

    Ok(Json(ExecuteAsyncResponse {
        execution_id: execution_id.to_string(),
        event_id,
        status: "queued".to_string(),
    }))
}
