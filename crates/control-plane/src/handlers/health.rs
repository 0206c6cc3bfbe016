//! Health endpoint.

use axum::extract::State;
use axum::Json;

use crate::db::pool::health_check;
use crate::state::AppState;

/// `GET /health`: liveness plus database reachability.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database_ok = health_check(&state.db).await;
    Json(serde_json::json!({
        "status": if database_ok { "ok" } else { "degraded" },
        "database": database_ok,
    }))
}
