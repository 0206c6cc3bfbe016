//! Catalog endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::db::models::{CatalogRegisterRequest, CatalogRegisterResponse};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// `POST /catalog/register`: register a playbook or secret.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<CatalogRegisterRequest>,
) -> AppResult<Json<CatalogRegisterResponse>> {
    let response = state.catalog.register(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub resource_type: Option<String>,
}

/// `GET /catalog/list?resource_type=...`: list entries, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let entries = state.catalog.list(query.resource_type.as_deref()).await?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

/// `GET /catalog/{path...}/{version}`: fetch one entry.
///
/// The path may contain slashes; the trailing segment is the version
/// (`latest` accepted). A missing slashed path retries on its last segment.
pub async fn fetch(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let (path, version) = split_path_version(&rest)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid catalog path: '{}'", rest)))?;

    let entry = state.catalog.fetch(path, Some(version)).await?;
    Ok(Json(serde_json::to_value(entry)?))
}

/// Split `a/b/c/<version>` into path and version.
fn split_path_version(rest: &str) -> Option<(&str, &str)> {
    let trimmed = rest.trim_matches('/');
    let (path, version) = trimmed.rsplit_once('/')?;
    if path.is_empty() || version.is_empty() {
        return None;
    }
    Some((path, version))
}
