//! PostgreSQL task plugin.
//!
//! Commands arrive base64-encoded (plain SQL is accepted too), render once
//! over the combined context, and are split on `;` with quote and
//! dollar-quote awareness. Statements run inside a single transaction,
//! except `CALL`, which runs in autocommit. A failed statement marks the
//! whole task as error with aggregated messages, but later statements still
//! run and their results are reported.
//!
//! Connections are opened per task and closed on completion; there is no
//! pooling.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::sync::Arc;
use tokio_postgres::{NoTls, SimpleQueryMessage};

use crate::auth::{postgres_params, AuthResolver};
use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::registry::{Tool, ToolConfig};
use crate::result::ToolResult;
use crate::sql::split_statements;
use crate::template::TemplateEngine;

/// PostgreSQL task plugin.
pub struct PostgresTool {
    resolver: Arc<AuthResolver>,
    template: TemplateEngine,
}

impl PostgresTool {
    pub fn new(resolver: Arc<AuthResolver>) -> Self {
        Self {
            resolver,
            template: TemplateEngine::new(),
        }
    }

    /// Decode a command that may be base64-encoded SQL.
    pub fn decode_command(raw: &str) -> String {
        if let Ok(bytes) = BASE64.decode(raw.trim().as_bytes()) {
            if let Ok(text) = String::from_utf8(bytes) {
                // Decoded garbage from a short plain statement is unlikely to
                // contain SQL whitespace; require something statement-like.
                if text.chars().any(|c| c.is_whitespace()) || text.len() > 16 {
                    return text;
                }
            }
        }
        raw.to_string()
    }

    /// Execute rendered statements over one connection.
    pub async fn run_statements(
        conn_string: &str,
        statements: &[String],
    ) -> Result<(Value, Vec<String>), ToolError> {
        let (client, connection) = tokio_postgres::connect(conn_string, NoTls).await?;

        // Drive the connection until the client drops.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection error");
            }
        });

        let mut results = serde_json::Map::new();
        let mut errors = Vec::new();
        let mut in_txn = false;

        for (i, stmt) in statements.iter().enumerate() {
            let key = format!("command_{}", i);
            let is_call = stmt.trim_start().to_uppercase().starts_with("CALL");

            if is_call && in_txn {
                let _ = client.simple_query("COMMIT").await;
                in_txn = false;
            }
            if !is_call && !in_txn {
                client.simple_query("BEGIN").await?;
                in_txn = true;
            }

            match client.simple_query(stmt).await {
                Ok(messages) => {
                    results.insert(key, command_result(&messages));
                }
                Err(e) => {
                    let message = e.to_string();
                    results.insert(
                        key,
                        serde_json::json!({"status": "error", "message": message}),
                    );
                    errors.push(format!("statement {}: {}", i, message));
                    if in_txn {
                        // The transaction is aborted; reset so later
                        // statements can still run.
                        let _ = client.simple_query("ROLLBACK").await;
                        in_txn = false;
                    }
                }
            }
        }

        if in_txn {
            client.simple_query("COMMIT").await?;
        }

        drop(client);
        let _ = driver.await;

        Ok((Value::Object(results), errors))
    }
}

#[async_trait]
impl Tool for PostgresTool {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();
        let template_ctx = ctx.to_template_context();

        let auth_spec = config.auth.clone().ok_or_else(|| {
            ToolError::Auth("postgres task requires an 'auth' block".to_string())
        })?;
        let resolved = self
            .resolver
            .resolve(&auth_spec, &self.template, &template_ctx)
            .await?;
        let auth = resolved
            .items
            .values()
            .next()
            .ok_or_else(|| ToolError::Auth("postgres auth resolved to nothing".to_string()))?;
        let params = postgres_params(auth, &self.template, &template_ctx)?;

        // Gather commands: a single string or a list
        let raw_commands: Vec<String> = match config
            .field("command")
            .or_else(|| config.field("commands"))
            .or_else(|| config.field("sql"))
        {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => {
                return Err(ToolError::Configuration(
                    "postgres task requires a 'command'".to_string(),
                ))
            }
        };

        // One render over the combined context, then split
        let mut statements = Vec::new();
        for raw in &raw_commands {
            let decoded = Self::decode_command(raw);
            let rendered = self.template.render(&decoded, &template_ctx)?;
            statements.extend(split_statements(&rendered));
        }

        tracing::debug!(
            host = %params.host,
            database = %params.database,
            statement_count = statements.len(),
            "Executing postgres task"
        );

        let (results, errors) =
            Self::run_statements(&params.to_conn_string(), &statements).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if errors.is_empty() {
            Ok(ToolResult::success(results).with_duration(duration_ms))
        } else {
            Ok(ToolResult::error(errors.join("; "))
                .with_data(results)
                .with_duration(duration_ms))
        }
    }
}

/// Convert simple-query messages into one command's result record.
fn command_result(messages: &[SimpleQueryMessage]) -> Value {
    let mut rows: Vec<Value> = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    let mut affected: Option<u64> = None;

    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let mut obj = serde_json::Map::new();
                for (i, col) in row.columns().iter().enumerate() {
                    let value = match row.get(i) {
                        Some(text) => cell_value(text),
                        None => Value::Null,
                    };
                    obj.insert(col.name().to_string(), value);
                }
                rows.push(Value::Object(obj));
            }
            SimpleQueryMessage::CommandComplete(n) => {
                affected = Some(*n);
            }
            _ => {}
        }
    }

    if rows.is_empty() {
        serde_json::json!({
            "status": "success",
            "row_count": affected.unwrap_or(0),
            "message": format!("{} row(s) affected", affected.unwrap_or(0)),
        })
    } else {
        serde_json::json!({
            "status": "success",
            "columns": columns,
            "rows": rows,
            "row_count": rows.len(),
        })
    }
}

/// Coerce a text cell from the simple protocol into a JSON value.
///
/// Integers and decimals become numbers; everything else, including JSON
/// text, stays a string.
fn cell_value(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = text.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(text.to_string())
}
