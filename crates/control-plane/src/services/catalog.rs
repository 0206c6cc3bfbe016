//! Catalog service.
//!
//! Content-addressable, versioned storage of playbooks and credentials.
//! Registration computes the next dotted version (`0.1.0` if none, PATCH
//! bump otherwise) and retries a bounded number of times on unique-version
//! collisions. Fetching falls back to the last path segment when a slashed
//! path misses.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;

use crate::db::models::catalog::{bump_patch, parse_version, CatalogEntry};
use crate::db::models::{CatalogRegisterRequest, CatalogRegisterResponse};
use crate::db::queries::catalog as queries;
use crate::db::DbPool;
use crate::engine::PlaybookSource;
use crate::error::{AppError, AppResult};
use crate::playbook::{parse_playbook, Playbook};

/// Initial version for a new path.
const INITIAL_VERSION: &str = "0.1.0";

/// Attempts on unique-version collision before giving up.
const REGISTER_RETRIES: usize = 3;

/// Service for catalog operations.
#[derive(Clone)]
pub struct CatalogService {
    pool: DbPool,
}

impl CatalogService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a resource, assigning the next version for its path.
    pub async fn register(
        &self,
        request: CatalogRegisterRequest,
    ) -> AppResult<CatalogRegisterResponse> {
        let content = decode_content(&request.content_base64)?;

        let yaml: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|e| AppError::Parse(format!("Invalid YAML: {}", e)))?;

        let path = yaml
            .get("path")
            .and_then(|v| v.as_str())
            .or_else(|| yaml.get("name").and_then(|v| v.as_str()))
            .ok_or_else(|| {
                AppError::Validation("Resource requires a 'path' or 'name'".to_string())
            })?
            .to_string();

        let resource_type = yaml
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or(&request.resource_type)
            .to_string();

        // Playbooks are validated before they enter the catalog
        if resource_type == "Playbook" {
            parse_playbook(&content)?;
        }

        let payload = yaml
            .get("workload")
            .or_else(|| yaml.get("data"))
            .map(|v| serde_json::to_value(v).unwrap_or(serde_json::Value::Null));
        let meta = yaml
            .get("meta")
            .map(|v| serde_json::to_value(v).unwrap_or(serde_json::Value::Null));

        let mut last_error = None;
        for _ in 0..REGISTER_RETRIES {
            let version = self.next_version(&path).await?;
            let entry = CatalogEntry {
                resource_path: path.clone(),
                resource_version: version.clone(),
                resource_type: resource_type.clone(),
                content: content.clone(),
                payload: payload.clone(),
                meta: meta.clone(),
                created_at: Utc::now(),
            };

            match queries::insert_entry(&self.pool, &entry).await {
                Ok(()) => {
                    tracing::info!(path = %path, version = %version, "Registered catalog resource");
                    return Ok(CatalogRegisterResponse {
                        status: "success".to_string(),
                        resource_path: path,
                        resource_version: version,
                        resource_type,
                    });
                }
                Err(AppError::Database(e)) if is_unique_violation(&e) => {
                    tracing::warn!(path = %path, version = %version, "Version collision, retrying");
                    last_error = Some(AppError::Database(e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::Conflict(format!("Could not assign a version for '{}'", path))
        }))
    }

    /// The next version for a path: `0.1.0` if none, highest-PATCH bump
    /// otherwise.
    pub async fn next_version(&self, path: &str) -> AppResult<String> {
        let versions = queries::versions_for_path(&self.pool, path).await?;
        Ok(next_version_from(&versions))
    }

    /// Fetch an entry; `version` may be "latest" or absent.
    pub async fn fetch(&self, path: &str, version: Option<&str>) -> AppResult<CatalogEntry> {
        let resolved = match version {
            Some(v) if v != "latest" => {
                if let Some(entry) = queries::by_path_version(&self.pool, path, v).await? {
                    return Ok(entry);
                }
                None
            }
            _ => self.latest_entry(path).await?,
        };

        if let Some(entry) = resolved {
            return Ok(entry);
        }

        // filename fallback for slashed paths
        if let Some(tail) = path.rsplit('/').next() {
            if tail != path {
                tracing::debug!(path = %path, tail = %tail, "Retrying fetch with filename fallback");
                if let Some(entry) = match version {
                    Some(v) if v != "latest" => {
                        queries::by_path_version(&self.pool, tail, v).await?
                    }
                    _ => self.latest_entry(tail).await?,
                } {
                    return Ok(entry);
                }
            }
        }

        Err(AppError::NotFound(format!(
            "Catalog entry '{}' (version {}) not found",
            path,
            version.unwrap_or("latest")
        )))
    }

    /// The entry with the numerically-highest version for a path.
    async fn latest_entry(&self, path: &str) -> AppResult<Option<CatalogEntry>> {
        let entries = queries::all_for_path(&self.pool, path).await?;
        Ok(pick_latest(entries))
    }

    /// The latest version string for a path.
    pub async fn latest_version(&self, path: &str) -> AppResult<Option<String>> {
        Ok(self
            .latest_entry(path)
            .await?
            .map(|e| e.resource_version))
    }

    /// List entries ordered by insertion time descending.
    pub async fn list(&self, resource_type: Option<&str>) -> AppResult<Vec<CatalogEntry>> {
        queries::list_entries(&self.pool, resource_type).await
    }
}

#[async_trait]
impl PlaybookSource for CatalogService {
    async fn load(&self, path: &str, version: Option<&str>) -> AppResult<Playbook> {
        let entry = self.fetch(path, version).await?;
        parse_playbook(&entry.content)
    }
}

/// Decode content that may be base64-encoded YAML.
fn decode_content(raw: &str) -> AppResult<String> {
    if let Ok(bytes) = BASE64.decode(raw.trim().as_bytes()) {
        if let Ok(text) = String::from_utf8(bytes) {
            return Ok(text);
        }
    }
    Ok(raw.to_string())
}

/// Compute the next version from the existing set.
fn next_version_from(versions: &[String]) -> String {
    versions
        .iter()
        .filter_map(|v| parse_version(v).map(|t| (t, v)))
        .max_by_key(|(t, _)| *t)
        .and_then(|(_, v)| bump_patch(v))
        .unwrap_or_else(|| INITIAL_VERSION.to_string())
}

/// Pick the entry with the highest version triple.
fn pick_latest(entries: Vec<CatalogEntry>) -> Option<CatalogEntry> {
    entries
        .into_iter()
        .filter_map(|e| parse_version(&e.resource_version).map(|t| (t, e)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, e)| e)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.is_unique_violation()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_from_empty() {
        assert_eq!(next_version_from(&[]), "0.1.0");
    }

    #[test]
    fn test_next_version_bumps_patch() {
        let versions = vec!["0.1.0".to_string(), "0.1.2".to_string(), "0.1.1".to_string()];
        assert_eq!(next_version_from(&versions), "0.1.3");
    }

    #[test]
    fn test_next_version_numeric_ordering() {
        // 0.1.10 outranks 0.1.9
        let versions = vec!["0.1.9".to_string(), "0.1.10".to_string()];
        assert_eq!(next_version_from(&versions), "0.1.11");
    }

    #[test]
    fn test_next_version_ignores_junk() {
        let versions = vec!["garbage".to_string(), "0.2.0".to_string()];
        assert_eq!(next_version_from(&versions), "0.2.1");
    }

    #[test]
    fn test_decode_content_both_forms() {
        let yaml = "name: demo\n";
        let encoded = BASE64.encode(yaml);
        assert_eq!(decode_content(&encoded).unwrap(), yaml);
        assert_eq!(decode_content(yaml).unwrap(), yaml);
    }

    #[test]
    fn test_pick_latest() {
        let make = |version: &str| CatalogEntry {
            resource_path: "p".to_string(),
            resource_version: version.to_string(),
            resource_type: "Playbook".to_string(),
            content: String::new(),
            payload: None,
            meta: None,
            created_at: Utc::now(),
        };
        let latest = pick_latest(vec![make("0.1.2"), make("0.1.10"), make("0.1.9")]).unwrap();
        assert_eq!(latest.resource_version, "0.1.10");
    }
}
