//! Credential endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::db::models::{CredentialRequest, CredentialResponse};
use crate::error::AppResult;
use crate::state::AppState;

/// `POST /credentials`: create or update a credential.
pub async fn create_or_update(
    State(state): State<AppState>,
    Json(request): Json<CredentialRequest>,
) -> AppResult<Json<CredentialResponse>> {
    let response = state.credentials.upsert(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub include_data: bool,
}

/// `GET /credentials/{name}?include_data=true`: fetch one credential.
pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<GetQuery>,
) -> AppResult<Json<CredentialResponse>> {
    let response = state.credentials.get(&name, query.include_data).await?;
    Ok(Json(response))
}

/// `GET /credentials`: list credentials without payloads.
pub async fn list(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let credentials = state.credentials.list().await?;
    Ok(Json(serde_json::json!({ "credentials": credentials })))
}
