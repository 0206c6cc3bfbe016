//! Authentication resolver.
//!
//! An `auth` block comes in three shapes:
//!
//! - a string key naming a catalog credential,
//! - a single-mode mapping (`type`/`key`/inline fields/`env` indirection),
//! - an alias map of `alias -> single-mode mapping`.
//!
//! Resolution expands templates against the context, fetches referenced
//! credentials through a [`CredentialSource`], applies `env` indirection, and
//! merges inline overrides. The result is a named bundle of
//! [`ResolvedAuth`] items plus a mode indicator.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::ToolError;
use crate::template::TemplateEngine;

/// Fields that select or shape a credential rather than belonging to its
/// payload.
const CONTROL_FIELDS: &[&str] = &["type", "service", "key", "credential", "secret", "env", "scope"];

/// A stored credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,

    /// Handler selector ("postgres", "gcs", "gcs_hmac", "s3", "snowflake", ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific secret fields.
    pub data: serde_json::Value,
}

/// Source of credentials by name.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Credential, ToolError>;
}

/// In-memory credential source for tests and local worker runs.
#[derive(Default)]
pub struct MemoryCredentialSource {
    credentials: std::sync::Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: Credential) {
        if let Ok(mut map) = self.credentials.lock() {
            map.insert(credential.name.clone(), credential);
        }
    }
}

#[async_trait]
impl CredentialSource for MemoryCredentialSource {
    async fn fetch(&self, name: &str) -> Result<Credential, ToolError> {
        self.credentials
            .lock()
            .map_err(|_| ToolError::Auth("credential store poisoned".to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::Auth(format!("Credential '{}' not found", name)))
    }
}

/// Resolution mode of an auth block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Single,
    AliasMap,
}

/// One resolved credential with its service type and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAuth {
    /// Service selector driving the plugin-specific mapping.
    pub service: String,

    /// Concrete secret payload (host/user/password, key_id/secret, ...).
    pub payload: serde_json::Value,

    /// Optional scope (bucket URL for cloud secrets).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ResolvedAuth {
    /// Fetch a payload field as a string, trying several aliases.
    pub fn field(&self, names: &[&str]) -> Option<String> {
        for name in names {
            if let Some(v) = self.payload.get(*name) {
                match v {
                    serde_json::Value::String(s) if !s.is_empty() => return Some(s.clone()),
                    serde_json::Value::Number(n) => return Some(n.to_string()),
                    _ => {}
                }
            }
        }
        None
    }
}

/// A resolved auth block: alias -> credential, ordered for deterministic DDL.
#[derive(Debug, Clone)]
pub struct ResolvedAuthSet {
    pub mode: AuthMode,
    pub items: BTreeMap<String, ResolvedAuth>,
}

impl ResolvedAuthSet {
    /// The single resolved item, when the block was single-mode.
    pub fn primary(&self) -> Option<&ResolvedAuth> {
        match self.mode {
            AuthMode::Single => self.items.values().next(),
            AuthMode::AliasMap => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Rewrite a legacy `credential`/`credentials` field into `auth`.
///
/// Returns true when a rewrite happened so the caller can log the warning.
pub fn normalize_legacy_auth(config: &mut serde_json::Value) -> bool {
    let Some(map) = config.as_object_mut() else {
        return false;
    };
    if map.contains_key("auth") {
        return false;
    }
    for legacy in ["credential", "credentials"] {
        if let Some(value) = map.remove(legacy) {
            map.insert("auth".to_string(), value);
            return true;
        }
    }
    false
}

/// Postgres connection parameters derived from a resolved credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sslmode: Option<String>,
}

impl PgConnectionParams {
    /// Render a libpq-style connection string.
    pub fn to_conn_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("user={}", self.user),
            format!("dbname={}", self.database),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password={}", self.password));
        }
        if let Some(ref sslmode) = self.sslmode {
            parts.push(format!("sslmode={}", sslmode));
        }
        parts.join(" ")
    }
}

/// Authentication resolver backed by a credential source.
pub struct AuthResolver {
    source: Arc<dyn CredentialSource>,
}

impl AuthResolver {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self { source }
    }

    /// Resolve an auth block against the live context.
    pub async fn resolve(
        &self,
        spec: &serde_json::Value,
        engine: &TemplateEngine,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<ResolvedAuthSet, ToolError> {
        let rendered = engine.render_value(spec, context)?;

        match rendered {
            serde_json::Value::String(key) => {
                let auth = self.resolve_key(&key).await?;
                let mut items = BTreeMap::new();
                items.insert("default".to_string(), auth);
                Ok(ResolvedAuthSet {
                    mode: AuthMode::Single,
                    items,
                })
            }
            serde_json::Value::Object(map) => {
                if is_alias_map(&map) {
                    let mut items = BTreeMap::new();
                    for (alias, entry) in &map {
                        let auth = self.resolve_entry(entry).await?;
                        items.insert(alias.clone(), auth);
                    }
                    Ok(ResolvedAuthSet {
                        mode: AuthMode::AliasMap,
                        items,
                    })
                } else {
                    let auth = self
                        .resolve_entry(&serde_json::Value::Object(map))
                        .await?;
                    let mut items = BTreeMap::new();
                    items.insert("default".to_string(), auth);
                    Ok(ResolvedAuthSet {
                        mode: AuthMode::Single,
                        items,
                    })
                }
            }
            other => Err(ToolError::Auth(format!(
                "Unsupported auth block shape: {}",
                other
            ))),
        }
    }

    async fn resolve_key(&self, key: &str) -> Result<ResolvedAuth, ToolError> {
        let credential = self.source.fetch(key).await?;
        Ok(ResolvedAuth {
            service: credential.kind,
            payload: credential.data,
            scope: None,
        })
    }

    /// Resolve one single-mode entry: fetch by key, apply env indirection,
    /// merge inline overrides.
    async fn resolve_entry(&self, entry: &serde_json::Value) -> Result<ResolvedAuth, ToolError> {
        let serde_json::Value::Object(map) = entry else {
            if let serde_json::Value::String(key) = entry {
                return self.resolve_key(key).await;
            }
            return Err(ToolError::Auth(format!("Invalid auth entry: {}", entry)));
        };

        let key = map
            .get("key")
            .or_else(|| map.get("credential"))
            .or_else(|| map.get("secret"))
            .and_then(|v| v.as_str());

        let mut service = map
            .get("type")
            .or_else(|| map.get("service"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut payload = serde_json::Map::new();

        if let Some(key) = key {
            let credential = self.source.fetch(key).await?;
            if service.is_none() {
                service = Some(credential.kind);
            }
            if let serde_json::Value::Object(data) = credential.data {
                payload.extend(data);
            }
        }

        // env indirection: {field: ENV_NAME} read at resolve time
        if let Some(serde_json::Value::Object(env_map)) = map.get("env") {
            for (field, env_name) in env_map {
                if let Some(name) = env_name.as_str() {
                    match std::env::var(name) {
                        Ok(value) => {
                            payload.insert(field.clone(), serde_json::json!(value));
                        }
                        Err(_) => {
                            return Err(ToolError::Auth(format!(
                                "Environment variable '{}' for auth field '{}' is not set",
                                name, field
                            )))
                        }
                    }
                }
            }
        }

        // inline fields override fetched data; a nested `data` block merges
        if let Some(serde_json::Value::Object(data)) = map.get("data") {
            payload.extend(data.clone());
        }
        for (k, v) in map {
            if CONTROL_FIELDS.contains(&k.as_str()) || k == "data" {
                continue;
            }
            payload.insert(k.clone(), v.clone());
        }

        let scope = map.get("scope").and_then(|v| v.as_str()).map(String::from);

        Ok(ResolvedAuth {
            service: service.unwrap_or_else(|| "unknown".to_string()),
            payload: serde_json::Value::Object(payload),
            scope,
        })
    }
}

/// An object is an alias map when it has no single-mode control fields and
/// every value is itself a mapping.
fn is_alias_map(map: &serde_json::Map<String, serde_json::Value>) -> bool {
    if map.is_empty() {
        return false;
    }
    if map.keys().any(|k| CONTROL_FIELDS.contains(&k.as_str()) || k == "data") {
        return false;
    }
    map.values().all(|v| v.is_object())
}

// ============================================================================
// Plugin-specific mappings
// ============================================================================

/// Map a resolved credential to postgres connection parameters.
///
/// Field values may still contain templates; they render strictly so a
/// missing parameter surfaces at connection-config time.
pub fn postgres_params(
    auth: &ResolvedAuth,
    engine: &TemplateEngine,
    context: &HashMap<String, serde_json::Value>,
) -> Result<PgConnectionParams, ToolError> {
    let payload = engine.render_value(&auth.payload, context)?;
    let rendered = ResolvedAuth {
        service: auth.service.clone(),
        payload,
        scope: auth.scope.clone(),
    };

    let host = rendered
        .field(&["host", "db_host"])
        .unwrap_or_else(|| "localhost".to_string());
    let port = rendered
        .field(&["port", "db_port"])
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(5432);
    let user = rendered
        .field(&["user", "username", "db_user"])
        .unwrap_or_else(|| "postgres".to_string());
    let password = rendered
        .field(&["password", "db_password"])
        .unwrap_or_default();
    let database = rendered
        .field(&["database", "dbname", "db_name"])
        .unwrap_or_else(|| "postgres".to_string());
    let sslmode = rendered.field(&["sslmode"]);

    Ok(PgConnectionParams {
        host,
        port,
        user,
        password,
        database,
        sslmode,
    })
}

/// Build HTTP auth headers from a resolved credential.
///
/// The payload selects the scheme via `method` (or `auth_type`):
/// bearer, basic, or api_key.
pub fn http_headers(auth: &ResolvedAuth) -> Result<Vec<(String, String)>, ToolError> {
    let method = auth
        .field(&["method", "auth_type", "scheme"])
        .unwrap_or_else(|| {
            if auth.field(&["token"]).is_some() {
                "bearer".to_string()
            } else if auth.field(&["username", "user"]).is_some() {
                "basic".to_string()
            } else {
                "api_key".to_string()
            }
        });

    match method.as_str() {
        "bearer" => {
            let token = auth.field(&["token", "access_token"]).ok_or_else(|| {
                ToolError::Auth("Bearer auth requires a 'token' field".to_string())
            })?;
            Ok(vec![("Authorization".to_string(), format!("Bearer {}", token))])
        }
        "basic" => {
            let user = auth.field(&["username", "user"]).ok_or_else(|| {
                ToolError::Auth("Basic auth requires a 'username' field".to_string())
            })?;
            let password = auth.field(&["password"]).unwrap_or_default();
            let encoded = BASE64.encode(format!("{}:{}", user, password));
            Ok(vec![("Authorization".to_string(), format!("Basic {}", encoded))])
        }
        "api_key" => {
            let header = auth
                .field(&["header"])
                .unwrap_or_else(|| "X-API-Key".to_string());
            let value = auth.field(&["token", "key", "api_key"]).ok_or_else(|| {
                ToolError::Auth("API key auth requires a 'token' or 'key' field".to_string())
            })?;
            Ok(vec![(header, value)])
        }
        other => Err(ToolError::Auth(format!(
            "Unsupported HTTP auth method: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_source() -> Arc<MemoryCredentialSource> {
        let source = Arc::new(MemoryCredentialSource::new());
        source.insert(Credential {
            name: "pg_local".to_string(),
            kind: "postgres".to_string(),
            data: serde_json::json!({
                "host": "localhost",
                "port": 5432,
                "user": "noetl",
                "password": "noetl",
                "database": "demo_noetl"
            }),
        });
        source.insert(Credential {
            name: "api_token".to_string(),
            kind: "bearer".to_string(),
            data: serde_json::json!({"token": "tok-123"}),
        });
        source
    }

    #[tokio::test]
    async fn test_resolve_string_key() {
        let resolver = AuthResolver::new(memory_source());
        let engine = TemplateEngine::new();
        let ctx = HashMap::new();

        let set = resolver
            .resolve(&serde_json::json!("pg_local"), &engine, &ctx)
            .await
            .unwrap();

        assert_eq!(set.mode, AuthMode::Single);
        let auth = set.primary().unwrap();
        assert_eq!(auth.service, "postgres");
        assert_eq!(auth.payload["user"], serde_json::json!("noetl"));
    }

    #[tokio::test]
    async fn test_resolve_single_with_overrides() {
        let resolver = AuthResolver::new(memory_source());
        let engine = TemplateEngine::new();
        let ctx = HashMap::new();

        let spec = serde_json::json!({"key": "pg_local", "database": "other_db"});
        let set = resolver.resolve(&spec, &engine, &ctx).await.unwrap();

        let auth = set.primary().unwrap();
        assert_eq!(auth.payload["database"], serde_json::json!("other_db"));
        assert_eq!(auth.payload["host"], serde_json::json!("localhost"));
    }

    #[tokio::test]
    async fn test_resolve_alias_map() {
        let resolver = AuthResolver::new(memory_source());
        let engine = TemplateEngine::new();
        let ctx = HashMap::new();

        let spec = serde_json::json!({
            "pg": {"key": "pg_local"},
            "api": {"key": "api_token"}
        });
        let set = resolver.resolve(&spec, &engine, &ctx).await.unwrap();

        assert_eq!(set.mode, AuthMode::AliasMap);
        assert_eq!(set.items.len(), 2);
        assert_eq!(set.items["api"].service, "bearer");
    }

    #[tokio::test]
    async fn test_resolve_templated_key() {
        let resolver = AuthResolver::new(memory_source());
        let engine = TemplateEngine::new();
        let mut ctx = HashMap::new();
        ctx.insert("cred_name".to_string(), serde_json::json!("pg_local"));

        let set = resolver
            .resolve(&serde_json::json!("{{ cred_name }}"), &engine, &ctx)
            .await
            .unwrap();
        assert_eq!(set.primary().unwrap().service, "postgres");
    }

    #[tokio::test]
    async fn test_resolve_missing_credential() {
        let resolver = AuthResolver::new(memory_source());
        let engine = TemplateEngine::new();
        let ctx = HashMap::new();

        let result = resolver
            .resolve(&serde_json::json!("absent"), &engine, &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::Auth(_))));
    }

    #[test]
    fn test_normalize_legacy_auth() {
        let mut config = serde_json::json!({"credential": "pg_local", "command": "x"});
        assert!(normalize_legacy_auth(&mut config));
        assert_eq!(config["auth"], serde_json::json!("pg_local"));
        assert!(config.get("credential").is_none());

        // existing auth wins
        let mut config = serde_json::json!({"auth": "a", "credentials": "b"});
        assert!(!normalize_legacy_auth(&mut config));
        assert_eq!(config["auth"], serde_json::json!("a"));
    }

    #[test]
    fn test_postgres_params_mapping() {
        let auth = ResolvedAuth {
            service: "postgres".to_string(),
            payload: serde_json::json!({
                "host": "db.example.com",
                "port": "5433",
                "user": "svc",
                "password": "secret",
                "database": "metrics",
                "sslmode": "require"
            }),
            scope: None,
        };
        let engine = TemplateEngine::new();
        let params = postgres_params(&auth, &engine, &HashMap::new()).unwrap();

        assert_eq!(params.host, "db.example.com");
        assert_eq!(params.port, 5433);
        let conn = params.to_conn_string();
        assert!(conn.contains("dbname=metrics"));
        assert!(conn.contains("sslmode=require"));
    }

    #[test]
    fn test_postgres_params_strict_render_fails_on_missing() {
        let auth = ResolvedAuth {
            service: "postgres".to_string(),
            payload: serde_json::json!({"host": "{{ missing_host }}"}),
            scope: None,
        };
        let engine = TemplateEngine::new();
        let result = postgres_params(&auth, &engine, &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_http_headers_bearer_and_basic() {
        let bearer = ResolvedAuth {
            service: "bearer".to_string(),
            payload: serde_json::json!({"token": "tok"}),
            scope: None,
        };
        let headers = http_headers(&bearer).unwrap();
        assert_eq!(headers[0].1, "Bearer tok");

        let basic = ResolvedAuth {
            service: "basic".to_string(),
            payload: serde_json::json!({"username": "u", "password": "p"}),
            scope: None,
        };
        let headers = http_headers(&basic).unwrap();
        assert!(headers[0].1.starts_with("Basic "));
    }

    #[test]
    fn test_http_headers_api_key() {
        let auth = ResolvedAuth {
            service: "api_key".to_string(),
            payload: serde_json::json!({"method": "api_key", "header": "X-Token", "key": "k1"}),
            scope: None,
        };
        let headers = http_headers(&auth).unwrap();
        assert_eq!(headers[0], ("X-Token".to_string(), "k1".to_string()));
    }
}
