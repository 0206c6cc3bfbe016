//! Catalog models.
//!
//! Catalog entries are immutable per `(path, version)`; versions are dotted
//! `MAJOR.MINOR.PATCH` strings compared as integer triples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Resource types stored in the catalog.
pub const RESOURCE_PLAYBOOK: &str = "Playbook";
pub const RESOURCE_SECRET: &str = "Secret";
pub const RESOURCE_CREDENTIAL: &str = "Credential";

/// Catalog entry representing one registered resource version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CatalogEntry {
    /// Resource path (e.g., "examples/weather_loop").
    pub resource_path: String,

    /// Dotted version string (e.g., "0.1.3").
    pub resource_version: String,

    /// Resource type (Playbook, Secret, Credential).
    pub resource_type: String,

    /// Raw YAML content.
    pub content: String,

    /// Parsed payload (workload for playbooks).
    pub payload: Option<serde_json::Value>,

    /// Additional metadata.
    pub meta: Option<serde_json::Value>,

    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

/// Parse a dotted version into an integer triple.
///
/// Missing segments default to zero; non-numeric segments fail.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Increment the PATCH component of a dotted version.
pub fn bump_patch(version: &str) -> Option<String> {
    let (major, minor, patch) = parse_version(version)?;
    Some(format!("{}.{}.{}", major, minor, patch + 1))
}

/// Request to register a catalog resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRegisterRequest {
    /// Base64-encoded YAML content (plain YAML also accepted).
    #[serde(alias = "content")]
    pub content_base64: String,

    /// Resource type (default: "Playbook").
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
}

fn default_resource_type() -> String {
    RESOURCE_PLAYBOOK.to_string()
}

/// Response after registering a catalog resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRegisterResponse {
    pub status: String,
    pub resource_path: String,
    pub resource_version: String,
    pub resource_type: String,
}
