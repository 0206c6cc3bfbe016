//! Bidirectional Snowflake/Postgres transfer tool.
//!
//! Streams rows from a source query into a target table in chunks. The
//! Snowflake side speaks the SQL REST API; the Postgres side uses a per-task
//! connection. Target DML is synthesized (INSERT, REPLACE, or UPSERT on key
//! columns) unless a target query is supplied. A progress callback fires per
//! chunk.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_postgres::{NoTls, SimpleQueryMessage};

use crate::auth::{postgres_params, secrets::escape_sql, AuthResolver, ResolvedAuth};
use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::registry::{Tool, ToolConfig};
use crate::result::ToolResult;
use crate::template::TemplateEngine;

/// Default rows per chunk.
const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Progress callback: `(chunk_index, rows_so_far)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SnowflakeToPostgres,
    PostgresToSnowflake,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::SnowflakeToPostgres => write!(f, "snowflake_to_postgres"),
            Direction::PostgresToSnowflake => write!(f, "postgres_to_snowflake"),
        }
    }
}

/// Write mode for the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Append,
    Replace,
    Upsert,
}

/// Snowflake/Postgres transfer tool.
pub struct TransferTool {
    resolver: Arc<AuthResolver>,
    template: TemplateEngine,
    client: reqwest::Client,
    progress: Option<ProgressFn>,
}

impl TransferTool {
    pub fn new(resolver: Arc<AuthResolver>) -> Self {
        Self {
            resolver,
            template: TemplateEngine::new(),
            client: reqwest::Client::new(),
            progress: None,
        }
    }

    /// Install a progress callback invoked after each chunk.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report_progress(&self, chunk: usize, rows: usize) {
        match &self.progress {
            Some(cb) => cb(chunk, rows),
            None => tracing::info!(chunk, rows, "transfer chunk complete"),
        }
    }

    /// Execute a statement against the Snowflake SQL REST API.
    async fn snowflake_query(
        &self,
        auth: &ResolvedAuth,
        statement: &str,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>), ToolError> {
        let account = auth.field(&["account", "sf_account"]).ok_or_else(|| {
            ToolError::Auth("snowflake credential missing 'account'".to_string())
        })?;
        let token = auth
            .field(&["token", "access_token", "password"])
            .ok_or_else(|| ToolError::Auth("snowflake credential missing 'token'".to_string()))?;

        let url = format!(
            "https://{}.snowflakecomputing.com/api/v2/statements",
            account
        );

        let mut body = serde_json::json!({"statement": statement});
        if let Some(warehouse) = auth.field(&["warehouse", "sf_warehouse"]) {
            body["warehouse"] = serde_json::json!(warehouse);
        }
        if let Some(database) = auth.field(&["database", "sf_database"]) {
            body["database"] = serde_json::json!(database);
        }
        if let Some(schema) = auth.field(&["schema", "sf_schema"]) {
            body["schema"] = serde_json::json!(schema);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload: Value = response.json().await?;

        if !status.is_success() {
            let message = payload
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("snowflake statement failed");
            return Err(ToolError::Database(format!(
                "snowflake API {}: {}",
                status, message
            )));
        }

        let columns: Vec<String> = payload
            .pointer("/resultSetMetaData/rowType")
            .and_then(|v| v.as_array())
            .map(|types| {
                types
                    .iter()
                    .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let rows: Vec<Vec<Value>> = payload
            .get("data")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.as_array().cloned())
                    .collect()
            })
            .unwrap_or_default();

        Ok((columns, rows))
    }

    /// Run the source query on postgres, returning columns and text rows.
    async fn postgres_query(
        &self,
        conn_string: &str,
        statement: &str,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>), ToolError> {
        let (client, connection) = tokio_postgres::connect(conn_string, NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection error");
            }
        });

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();

        for message in client.simple_query(statement).await? {
            if let SimpleQueryMessage::Row(row) = message {
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..columns.len())
                    .map(|i| match row.get(i) {
                        Some(text) => Value::String(text.to_string()),
                        None => Value::Null,
                    })
                    .collect();
                rows.push(values);
            }
        }

        drop(client);
        let _ = driver.await;

        Ok((columns, rows))
    }

    /// Apply chunks to a postgres target.
    async fn postgres_write(
        &self,
        conn_string: &str,
        statements: &[String],
    ) -> Result<(), ToolError> {
        let (client, connection) = tokio_postgres::connect(conn_string, NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection error");
            }
        });

        for stmt in statements {
            client.simple_query(stmt).await?;
        }

        drop(client);
        let _ = driver.await;
        Ok(())
    }
}

#[async_trait]
impl Tool for TransferTool {
    fn name(&self) -> &'static str {
        "transfer"
    }

    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();
        let template_ctx = ctx.to_template_context();
        let rendered = self.template.render_value(&config.config, &template_ctx)?;

        let source = rendered
            .get("source")
            .ok_or_else(|| ToolError::Configuration("transfer requires 'source'".to_string()))?;
        let target = rendered
            .get("target")
            .ok_or_else(|| ToolError::Configuration("transfer requires 'target'".to_string()))?;

        let source_type = type_of(source)?;
        let target_type = type_of(target)?;

        let direction = match (source_type.as_str(), target_type.as_str()) {
            ("snowflake", "postgres") => Direction::SnowflakeToPostgres,
            ("postgres", "snowflake") => Direction::PostgresToSnowflake,
            (s, t) => {
                return Err(ToolError::Configuration(format!(
                    "unsupported transfer direction: {} -> {}",
                    s, t
                )))
            }
        };

        let source_query = query_of(source)?;
        let source_auth = self.resolve_side(source, &template_ctx).await?;
        let target_auth = self.resolve_side(target, &template_ctx).await?;

        let table = target
            .get("table")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let target_query = target.get("query").and_then(|v| v.as_str()).map(String::from);
        if table.is_empty() && target_query.is_none() {
            return Err(ToolError::Configuration(
                "transfer target requires 'table' or 'query'".to_string(),
            ));
        }

        let mode: TransferMode = rendered
            .get("mode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let keys: Vec<String> = rendered
            .get("key")
            .map(|k| match k {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default();
        if mode == TransferMode::Upsert && keys.is_empty() {
            return Err(ToolError::Configuration(
                "upsert mode requires 'key' column(s)".to_string(),
            ));
        }

        let chunk_size = rendered
            .get("chunk_size")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .max(1);

        // Fetch from source
        let (columns, rows) = match direction {
            Direction::SnowflakeToPostgres => {
                self.snowflake_query(&source_auth, &source_query).await?
            }
            Direction::PostgresToSnowflake => {
                let params = postgres_params(&source_auth, &self.template, &template_ctx)?;
                self.postgres_query(&params.to_conn_string(), &source_query)
                    .await?
            }
        };

        // Write to target in chunks
        let mut rows_transferred = 0usize;
        let mut chunks_processed = 0usize;

        let chunks: Vec<&[Vec<Value>]> = rows.chunks(chunk_size).collect();
        for chunk in &chunks {
            let statements = match &target_query {
                Some(query) => vec![query.clone()],
                None => {
                    let mut stmts = Vec::new();
                    if chunks_processed == 0 && mode == TransferMode::Replace {
                        stmts.push(format!("TRUNCATE TABLE {}", table));
                    }
                    stmts.push(build_insert(&table, &columns, chunk, mode, &keys));
                    stmts
                }
            };

            match direction {
                Direction::SnowflakeToPostgres => {
                    let params = postgres_params(&target_auth, &self.template, &template_ctx)?;
                    self.postgres_write(&params.to_conn_string(), &statements)
                        .await?;
                }
                Direction::PostgresToSnowflake => {
                    for stmt in &statements {
                        self.snowflake_query(&target_auth, stmt).await?;
                    }
                }
            }

            rows_transferred += chunk.len();
            chunks_processed += 1;
            self.report_progress(chunks_processed, rows_transferred);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        Ok(ToolResult::success(serde_json::json!({
            "rows_transferred": rows_transferred,
            "chunks_processed": chunks_processed,
            "target_table": table,
            "direction": direction.to_string(),
            "columns": columns,
        }))
        .with_duration(duration_ms))
    }
}

impl TransferTool {
    async fn resolve_side(
        &self,
        side: &Value,
        template_ctx: &std::collections::HashMap<String, Value>,
    ) -> Result<ResolvedAuth, ToolError> {
        let spec = side
            .get("auth")
            .cloned()
            .ok_or_else(|| ToolError::Auth("transfer side requires 'auth'".to_string()))?;
        let resolved = self
            .resolver
            .resolve(&spec, &self.template, template_ctx)
            .await?;
        resolved
            .items
            .values()
            .next()
            .cloned()
            .ok_or_else(|| ToolError::Auth("transfer auth resolved to nothing".to_string()))
    }
}

fn type_of(side: &Value) -> Result<String, ToolError> {
    side.get("type")
        .or_else(|| side.get("tool"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| ToolError::Configuration("transfer side requires 'type'".to_string()))
}

fn query_of(side: &Value) -> Result<String, ToolError> {
    let raw = side
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::Configuration("transfer source requires 'query'".to_string()))?;

    if let Ok(bytes) = BASE64.decode(raw.trim().as_bytes()) {
        if let Ok(text) = String::from_utf8(bytes) {
            if text.chars().any(|c| c.is_whitespace()) {
                return Ok(text);
            }
        }
    }
    Ok(raw.to_string())
}

/// Build the chunk DML: INSERT, or INSERT .. ON CONFLICT for upsert mode.
fn build_insert(
    table: &str,
    columns: &[String],
    rows: &[Vec<Value>],
    mode: TransferMode,
    keys: &[String],
) -> String {
    let column_list = columns.join(", ");
    let values: Vec<String> = rows
        .iter()
        .map(|row| {
            let literals: Vec<String> = row.iter().map(sql_literal).collect();
            format!("({})", literals.join(", "))
        })
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        column_list,
        values.join(", ")
    );

    if mode == TransferMode::Upsert {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !keys.contains(c))
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect();
        sql.push_str(&format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            keys.join(", "),
            updates.join(", ")
        ));
    }

    sql
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

    #[test]
    fn test_build_insert_append() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec![serde_json::json!(1), serde_json::json!("a")],
            vec![serde_json::json!(2), serde_json::json!("it's")],
        ];
        let sql = build_insert("t", &columns, &rows, TransferMode::Append, &[]);
        assert_eq!(
            sql,
            "INSERT INTO t (id, name) VALUES (1, 'a'), (2, 'it''s')"
        );
    }

    #[test]
    fn test_build_insert_upsert() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![vec![serde_json::json!(1), serde_json::json!("a")]];
        let keys = vec!["id".to_string()];
        let sql = build_insert("t", &columns, &rows, TransferMode::Upsert, &keys);
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name"));
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(sql_literal(&serde_json::json!(1)), "1");
        assert_eq!(sql_literal(&serde_json::json!("x")), "'x'");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&serde_json::json!(true)), "true");
    }

    #[test]
    fn test_query_of_decodes_base64() {
        let side = serde_json::json!({"query": BASE64.encode("SELECT * FROM src")});
        assert_eq!(query_of(&side).unwrap(), "SELECT * FROM src");

        let side = serde_json::json!({"query": "SELECT 1"});
        assert_eq!(query_of(&side).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(
            Direction::SnowflakeToPostgres.to_string(),
            "snowflake_to_postgres"
        );
    }

    #[tokio::test]
    async fn test_unsupported_direction() {
        let resolver = Arc::new(AuthResolver::new(Arc::new(
            crate::auth::MemoryCredentialSource::new(),
        )));
        let tool = TransferTool::new(resolver);
        let config = ToolConfig::new(
            "transfer",
            serde_json::json!({
                "source": {"type": "duckdb", "query": "SELECT 1"},
                "target": {"type": "postgres", "table": "t"}
            }),
        );
        let ctx = ExecutionContext::default();

        let result = tool.execute(&config, &ctx).await;
        assert!(matches!(result, Err(ToolError::Configuration(_))));
    }
}
