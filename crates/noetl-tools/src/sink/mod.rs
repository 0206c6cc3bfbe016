//! Declarative result persistence.
//!
//! A `sink` block attached to a task or iterator writes the rendered payload
//! to a storage backend: the event log itself (implicit), postgres, duckdb,
//! an HTTP endpoint, or a code body. Database sinks either forward a
//! user-supplied statement (rewriting `:name` binds when the statement
//! carries no template markup) or synthesize an INSERT/UPSERT from
//! `table` + `data` + `mode`. Sink failure is fatal for the enclosing
//! iteration or step; sinks never silently drop data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{postgres_params, secrets::escape_sql, AuthResolver};
use crate::error::ToolError;
use crate::template::TemplateEngine;
use crate::tools::{CodeTool, HttpTool, PostgresTool};

/// Storage backend of a sink block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[serde(alias = "event_log")]
    Event,
    Postgres,
    Duckdb,
    Python,
    Http,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageKind::Event => "event",
            StorageKind::Postgres => "postgres",
            StorageKind::Duckdb => "duckdb",
            StorageKind::Python => "python",
            StorageKind::Http => "http",
        };
        write!(f, "{}", s)
    }
}

/// Write mode for database sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    #[default]
    Append,
    Upsert,
}

/// Parsed sink block.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub storage: StorageKind,
    pub data: Value,
    pub auth: Option<Value>,
    pub table: Option<String>,
    pub mode: SinkMode,
    pub key: Vec<String>,
    pub statement: Option<String>,
    pub endpoint: Option<String>,
    pub method: String,
    pub code: Option<String>,
    pub database: Option<String>,
    /// The raw spec, echoed into result metadata.
    pub spec: Value,
}

impl SinkConfig {
    /// Parse a raw sink block.
    pub fn parse(spec: &Value) -> Result<Self, ToolError> {
        let storage_value = spec
            .get("storage")
            .cloned()
            .ok_or_else(|| ToolError::Sink("sink requires a 'storage' kind".to_string()))?;
        let storage: StorageKind = serde_json::from_value(storage_value.clone())
            .map_err(|_| ToolError::Sink(format!("unknown sink storage: {}", storage_value)))?;

        let data = spec
            .get("data")
            .or_else(|| spec.get("args"))
            .cloned()
            .unwrap_or(Value::Null);

        let mode: SinkMode = spec
            .get("mode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let key: Vec<String> = match spec.get("key") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };

        if mode == SinkMode::Upsert && key.is_empty() {
            return Err(ToolError::Sink(
                "sink mode 'upsert' requires 'key' column(s)".to_string(),
            ));
        }

        Ok(Self {
            storage,
            data,
            auth: spec.get("auth").cloned(),
            table: spec.get("table").and_then(|v| v.as_str()).map(String::from),
            mode,
            key,
            statement: spec
                .get("statement")
                .and_then(|v| v.as_str())
                .map(String::from),
            endpoint: spec
                .get("endpoint")
                .and_then(|v| v.as_str())
                .map(String::from),
            method: spec
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or("POST")
                .to_string(),
            code: spec.get("code").and_then(|v| v.as_str()).map(String::from),
            database: spec
                .get("database")
                .or_else(|| spec.get("db_path"))
                .and_then(|v| v.as_str())
                .map(String::from),
            spec: spec.clone(),
        })
    }
}

/// Executes sink blocks against their storage backends.
pub struct SinkExecutor {
    template: TemplateEngine,
    resolver: Arc<AuthResolver>,
    http: Arc<HttpTool>,
}

impl SinkExecutor {
    pub fn new(resolver: Arc<AuthResolver>, http: Arc<HttpTool>) -> Self {
        Self {
            template: TemplateEngine::new(),
            resolver,
            http,
        }
    }

    /// Execute a sink block over the given context.
    ///
    /// Returns the sink result envelope; any error is fatal for the caller.
    pub async fn execute(
        &self,
        spec: &Value,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ToolError> {
        let config = SinkConfig::parse(spec)?;
        let rendered = self.template.render_value(&config.data, context)?;

        let credential_ref = config
            .auth
            .as_ref()
            .and_then(|a| a.as_str().map(String::from));

        let saved = match config.storage {
            StorageKind::Event => {
                // Implicit sink: the rendered data rides in the result
                // envelope and is captured by the event log.
                serde_json::json!({"saved": "event", "data": rendered})
            }
            StorageKind::Postgres => self.save_postgres(&config, &rendered, context).await?,
            StorageKind::Duckdb => self.save_duckdb(&config, &rendered, context).await?,
            StorageKind::Http => self.save_http(&config, &rendered, context).await?,
            StorageKind::Python => self.save_python(&config, rendered.clone()).await?,
        };

        Ok(serde_json::json!({
            "status": "success",
            "data": saved,
            "meta": {
                "storage_kind": config.storage.to_string(),
                "credential_ref": credential_ref,
                "sink_spec": config.spec,
            }
        }))
    }

    async fn save_postgres(
        &self,
        config: &SinkConfig,
        rendered: &Value,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ToolError> {
        let auth_spec = config
            .auth
            .clone()
            .ok_or_else(|| ToolError::Sink("postgres sink requires 'auth'".to_string()))?;
        let resolved = self
            .resolver
            .resolve(&auth_spec, &self.template, context)
            .await?;
        let auth = resolved
            .items
            .values()
            .next()
            .ok_or_else(|| ToolError::Sink("postgres sink auth resolved to nothing".to_string()))?;
        let params = postgres_params(auth, &self.template, context)?;

        let sql = self.build_statement(config, rendered, context)?;
        let (results, errors) =
            PostgresTool::run_statements(&params.to_conn_string(), &[sql]).await?;

        if !errors.is_empty() {
            return Err(ToolError::Sink(errors.join("; ")));
        }
        Ok(serde_json::json!({"saved": "postgres", "results": results}))
    }

    async fn save_duckdb(
        &self,
        config: &SinkConfig,
        rendered: &Value,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ToolError> {
        let sql = self.build_statement(config, rendered, context)?;
        let db_path = config.database.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<(), ToolError> {
            let conn = match db_path {
                Some(ref path) => duckdb::Connection::open(path)?,
                None => duckdb::Connection::open_in_memory()?,
            };
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
        .map_err(|e| ToolError::Sink(format!("duckdb sink join error: {}", e)))?;

        result.map_err(|e| ToolError::Sink(e.to_string()))?;
        Ok(serde_json::json!({"saved": "duckdb"}))
    }

    async fn save_http(
        &self,
        config: &SinkConfig,
        rendered: &Value,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ToolError> {
        let endpoint_raw = config
            .endpoint
            .clone()
            .ok_or_else(|| ToolError::Sink("http sink requires 'endpoint'".to_string()))?;
        let endpoint = self.template.render(&endpoint_raw, context)?;

        let (status_code, _headers, data) = self
            .http
            .request_raw(&config.method, &endpoint, &HashMap::new(), None, Some(rendered), None)
            .await?;

        if !(200..300).contains(&status_code) {
            return Err(ToolError::Sink(format!(
                "http sink got status {} from {}",
                status_code, endpoint
            )));
        }
        Ok(serde_json::json!({
            "saved": "http",
            "endpoint": endpoint,
            "status_code": status_code,
            "response": data,
        }))
    }

    async fn save_python(&self, config: &SinkConfig, rendered: Value) -> Result<Value, ToolError> {
        // Default body echoes the payload as JSON.
        let code = match &config.code {
            Some(raw) => CodeTool::decode_code(raw),
            None => "fn main(input_data) { input_data }".to_string(),
        };

        let mut args = serde_json::Map::new();
        args.insert("data".to_string(), rendered);

        let result = CodeTool::run_code(code, args)
            .await
            .map_err(|e| ToolError::Sink(e.to_string()))?;
        Ok(serde_json::json!({"saved": "python", "result": result}))
    }

    /// Produce the SQL for a database sink.
    fn build_statement(
        &self,
        config: &SinkConfig,
        rendered: &Value,
        context: &HashMap<String, Value>,
    ) -> Result<String, ToolError> {
        if let Some(ref statement) = config.statement {
            if TemplateEngine::is_template(statement) {
                return self.template.render(statement, context);
            }
            return Ok(rewrite_named_binds(statement, rendered));
        }

        let table = config
            .table
            .as_deref()
            .ok_or_else(|| ToolError::Sink("sink requires 'table' or 'statement'".to_string()))?;
        let Value::Object(map) = rendered else {
            return Err(ToolError::Sink(
                "sink 'data' must be a column mapping when synthesizing INSERT".to_string(),
            ));
        };

        let columns: Vec<&String> = map.keys().collect();
        let values: Vec<String> = map.values().map(sql_literal).collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            values.join(", ")
        );

        if config.mode == SinkMode::Upsert {
            let updates: Vec<String> = map
                .keys()
                .filter(|c| !config.key.contains(c))
                .map(|c| format!("{} = EXCLUDED.{}", c, c))
                .collect();
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                config.key.join(", "),
                updates.join(", ")
            ));
        }

        Ok(sql)
    }
}

/// Replace `:name` binds with literals from the rendered data mapping.
fn rewrite_named_binds(statement: &str, data: &Value) -> String {
    let Some(re) = regex::Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").ok() else {
        return statement.to_string();
    };
    re.replace_all(statement, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match data.get(name) {
            Some(value) => sql_literal(value),
            None => caps[0].to_string(),
        }
    })
    .to_string()
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", escape_sql(s)),
        other => format!("'{}'", escape_sql(&other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialSource;

    fn executor() -> SinkExecutor {
        let resolver = Arc::new(AuthResolver::new(Arc::new(MemoryCredentialSource::new())));
        let http = Arc::new(HttpTool::with_mock(
            Arc::clone(&resolver),
            Arc::new(crate::tools::MockTransport::new()),
        ));
        SinkExecutor::new(resolver, http)
    }

    #[tokio::test]
    async fn test_event_sink_returns_rendered_data() {
        let executor = executor();
        let mut ctx = HashMap::new();
        ctx.insert("item".to_string(), serde_json::json!({"id": 3}));

        let spec = serde_json::json!({"storage": "event", "data": {"id": "{{ item.id }}"}});
        let result = executor.execute(&spec, &ctx).await.unwrap();

        assert_eq!(result["status"], serde_json::json!("success"));
        assert_eq!(result["data"]["saved"], serde_json::json!("event"));
        assert_eq!(result["data"]["data"]["id"], serde_json::json!(3));
        assert_eq!(
            result["meta"]["storage_kind"],
            serde_json::json!("event")
        );
    }

    #[tokio::test]
    async fn test_event_log_alias() {
        let executor = executor();
        let spec = serde_json::json!({"storage": "event_log", "data": {"x": 1}});
        let result = executor.execute(&spec, &HashMap::new()).await.unwrap();
        assert_eq!(result["data"]["saved"], serde_json::json!("event"));
    }

    #[tokio::test]
    async fn test_http_sink_posts_payload() {
        let executor = executor();
        let spec = serde_json::json!({
            "storage": "http",
            "endpoint": "http://sink.local/collect",
            "data": {"value": 42}
        });
        let result = executor.execute(&spec, &HashMap::new()).await.unwrap();
        assert_eq!(result["data"]["saved"], serde_json::json!("http"));
        assert_eq!(result["data"]["status_code"], serde_json::json!(200));
    }

    #[tokio::test]
    async fn test_python_sink_default_body() {
        let executor = executor();
        let spec = serde_json::json!({"storage": "python", "data": {"n": 7}});
        let result = executor.execute(&spec, &HashMap::new()).await.unwrap();
        assert_eq!(
            result["data"]["result"]["data"]["n"],
            serde_json::json!(7)
        );
    }

    #[tokio::test]
    async fn test_upsert_requires_key() {
        let executor = executor();
        let spec = serde_json::json!({
            "storage": "postgres",
            "table": "t",
            "mode": "upsert",
            "data": {"id": 1}
        });
        let result = executor.execute(&spec, &HashMap::new()).await;
        assert!(matches!(result, Err(ToolError::Sink(_))));
    }

    #[test]
    fn test_build_statement_synthesized_insert() {
        let executor = executor();
        let config = SinkConfig::parse(&serde_json::json!({
            "storage": "postgres",
            "table": "weather",
            "data": {}
        }))
        .unwrap();
        let rendered = serde_json::json!({"city": "Bergen", "temp": 30});

        let sql = executor
            .build_statement(&config, &rendered, &HashMap::new())
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO weather (city, temp) VALUES ('Bergen', 30)"
        );
    }

    #[test]
    fn test_build_statement_upsert() {
        let executor = executor();
        let config = SinkConfig::parse(&serde_json::json!({
            "storage": "postgres",
            "table": "weather",
            "mode": "upsert",
            "key": "city",
            "data": {}
        }))
        .unwrap();
        let rendered = serde_json::json!({"city": "Bergen", "temp": 30});

        let sql = executor
            .build_statement(&config, &rendered, &HashMap::new())
            .unwrap();
        assert!(sql.contains("ON CONFLICT (city) DO UPDATE SET temp = EXCLUDED.temp"));
    }

    #[test]
    fn test_rewrite_named_binds() {
        let data = serde_json::json!({"id": 5, "name": "x"});
        let sql = rewrite_named_binds("INSERT INTO t VALUES (:id, :name, :missing)", &data);
        assert_eq!(sql, "INSERT INTO t VALUES (5, 'x', :missing)");
    }

    #[test]
    fn test_statement_with_template_markup_renders() {
        let executor = executor();
        let config = SinkConfig::parse(&serde_json::json!({
            "storage": "postgres",
            "statement": "INSERT INTO t VALUES ({{ v }})",
            "data": {}
        }))
        .unwrap();
        let mut ctx = HashMap::new();
        ctx.insert("v".to_string(), serde_json::json!(9));

        let sql = executor
            .build_statement(&config, &serde_json::json!({}), &ctx)
            .unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES (9)");
    }

    #[test]
    fn test_parse_rejects_unknown_storage() {
        let result = SinkConfig::parse(&serde_json::json!({"storage": "s3"}));
        assert!(matches!(result, Err(ToolError::Sink(_))));
    }
}
