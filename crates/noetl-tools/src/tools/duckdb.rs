//! DuckDB task plugin.
//!
//! Each task opens a fresh connection (no pooling; keeps file locks
//! short-lived on shared storage), installs the extensions its auth types
//! require, registers `CREATE SECRET` DDL for every resolved auth item,
//! auto-creates cloud secrets for bucket scopes the commands reference, and
//! executes the remaining statements collecting result samples.
//!
//! `COPY ... (FORMAT 'xlsx')` statements targeting `gs://`/`s3://` are
//! rewritten to a local workbook export and uploaded afterwards: GCS via a
//! service-account token; other destinations keep the local file and record
//! an explicit fallback note.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use duckdb::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{secrets, AuthResolver, GcpAuth, ResolvedAuth};
use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::registry::{Tool, ToolConfig};
use crate::result::ToolResult;
use crate::template::TemplateEngine;

/// Rows included in a command's result sample.
const SAMPLE_LIMIT: usize = 50;

/// A deferred cloud upload produced by an xlsx export.
#[derive(Debug, Clone)]
struct PendingUpload {
    destination: String,
    local_path: String,
}

/// DuckDB task plugin.
pub struct DuckdbTool {
    resolver: Arc<AuthResolver>,
    template: TemplateEngine,
    gcp: GcpAuth,
}

impl DuckdbTool {
    pub fn new(resolver: Arc<AuthResolver>) -> Self {
        Self {
            resolver,
            template: TemplateEngine::new(),
            gcp: GcpAuth::new(),
        }
    }

    /// Upload a local file to a `gs://bucket/object` destination.
    async fn upload_gcs(
        &self,
        destination: &str,
        local_path: &str,
        service_account_json: &str,
    ) -> Result<(), ToolError> {
        let rest = destination
            .strip_prefix("gs://")
            .or_else(|| destination.strip_prefix("gcs://"))
            .ok_or_else(|| ToolError::Configuration(format!("Not a GCS URL: {}", destination)))?;
        let (bucket, object) = rest.split_once('/').ok_or_else(|| {
            ToolError::Configuration(format!("GCS URL missing object path: {}", destination))
        })?;

        let token = self
            .gcp
            .token_from_service_account(
                service_account_json,
                &["https://www.googleapis.com/auth/devstorage.read_write"],
            )
            .await?;

        let bytes = tokio::fs::read(local_path).await?;
        let url = format!(
            "https://storage.googleapis.com/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            bucket, object
        );

        let client = reqwest::Client::new();
        let response = client
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ToolError::Http(format!(
                "GCS upload to {} failed with status {}",
                destination,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for DuckdbTool {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();
        let template_ctx = ctx.to_template_context();

        // Gather and render commands
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
                    "duckdb task requires a 'command'".to_string(),
                ))
            }
        };

        let mut statements = Vec::new();
        for raw in &raw_commands {
            let decoded = decode_command(raw);
            let rendered = self.template.render(&decoded, &template_ctx)?;
            statements.extend(crate::sql::split_statements(&rendered));
        }

        // Resolve auth items: explicit block plus dedicated cloud credentials
        let mut auth_items: Vec<(String, ResolvedAuth)> = Vec::new();
        if let Some(ref auth_spec) = config.auth {
            let resolved = self
                .resolver
                .resolve(auth_spec, &self.template, &template_ctx)
                .await?;
            for (alias, item) in resolved.items {
                auth_items.push((alias, item));
            }
        }
        for field in ["gcs_credential", "s3_credential", "cloud_credential"] {
            if let Some(name) = config.field(field).and_then(|v| v.as_str()) {
                let resolved = self
                    .resolver
                    .resolve(&Value::String(name.to_string()), &self.template, &template_ctx)
                    .await?;
                for (_, item) in resolved.items {
                    auth_items.push((sanitize_alias(name), item));
                }
            }
        }

        // Environment fallbacks for bucket scopes not covered by any secret
        let all_sql = statements.join(";\n");
        let referenced = secrets::scan_bucket_scopes(&all_sql);
        let covered: Vec<Option<String>> =
            auth_items.iter().map(|(_, a)| a.scope.clone()).collect();
        for scope in &referenced {
            if secrets::scope_covered(scope, &covered) {
                continue;
            }
            let env_name = if scope.starts_with("s3://") {
                "NOETL_S3_CREDENTIAL"
            } else {
                "NOETL_GCS_CREDENTIAL"
            };
            if let Ok(credential_name) = std::env::var(env_name) {
                let resolved = self
                    .resolver
                    .resolve(&Value::String(credential_name.clone()), &self.template, &template_ctx)
                    .await?;
                for (_, mut item) in resolved.items {
                    item.scope = Some(scope.clone());
                    auth_items.push((sanitize_alias(&format!("auto_{}", scope)), item));
                }
            } else {
                tracing::warn!(scope = %scope, "No credential covers bucket scope");
            }
        }

        // Pre-compute DDL before entering the blocking section
        let extensions = secrets::required_extensions(auth_items.iter().map(|(_, a)| a));
        let mut secret_ddl: Vec<String> = Vec::new();
        let mut secrets_created: Vec<String> = Vec::new();
        for (alias, item) in &auth_items {
            match secrets::secret_statements(alias, item) {
                Ok(stmts) => {
                    secret_ddl.extend(stmts);
                    secrets_created.push(alias.clone());
                }
                Err(e) => {
                    tracing::warn!(alias = %alias, error = %e, "Skipping secret with no DuckDB mapping");
                }
            }
        }

        let db_path = config
            .field("database")
            .or_else(|| config.field("db_path"))
            .and_then(|v| v.as_str())
            .map(String::from);

        // Run everything DuckDB-side on a blocking thread; the connection is
        // not Send and must stay on one thread.
        let run = tokio::task::spawn_blocking(move || {
            run_connection(db_path, extensions, secret_ddl, statements)
        })
        .await
        .map_err(|e| ToolError::Database(format!("duckdb task join error: {}", e)))?;
        let (results, mut excel_exports, errors) = run?;

        // Perform deferred uploads
        let service_account_json = auth_items
            .iter()
            .find_map(|(_, a)| a.field(&["service_account_json", "service_account"]));
        for export in &mut excel_exports {
            let destination = export["destination"].as_str().unwrap_or_default().to_string();
            let local_path = export["local_path"].as_str().unwrap_or_default().to_string();
            if destination.starts_with("gs://") || destination.starts_with("gcs://") {
                match &service_account_json {
                    Some(json) => match self.upload_gcs(&destination, &local_path, json).await {
                        Ok(()) => {
                            export["uploaded"] = serde_json::json!(true);
                            let _ = tokio::fs::remove_file(&local_path).await;
                        }
                        Err(e) => {
                            export["uploaded"] = serde_json::json!(false);
                            export["note"] = serde_json::json!(format!("upload failed: {}", e));
                        }
                    },
                    None => {
                        export["uploaded"] = serde_json::json!(false);
                        export["note"] = serde_json::json!(
                            "no service-account credential; file kept locally"
                        );
                    }
                }
            } else if destination.starts_with("s3://") {
                export["uploaded"] = serde_json::json!(false);
                export["note"] =
                    serde_json::json!("s3 upload requires signed requests; file kept locally");
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let data = serde_json::json!({
            "results": results,
            "secrets_created": secrets_created,
            "excel_exports": excel_exports,
        });

        if errors.is_empty() {
            Ok(ToolResult::success(data).with_duration(duration_ms))
        } else {
            Ok(ToolResult::error(errors.join("; "))
                .with_data(data)
                .with_duration(duration_ms))
        }
    }
}

/// Execute the whole command list on one connection.
#[allow(clippy::type_complexity)]
fn run_connection(
    db_path: Option<String>,
    extensions: Vec<String>,
    secret_ddl: Vec<String>,
    statements: Vec<String>,
) -> Result<(Value, Vec<Value>, Vec<String>), ToolError> {
    let conn = match db_path {
        Some(ref path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };

    for ext in &extensions {
        // Extension installs need network access; a miss only matters when a
        // statement actually uses the extension.
        for stmt in [format!("INSTALL {};", ext), format!("LOAD {};", ext)] {
            if let Err(e) = conn.execute_batch(&stmt) {
                tracing::warn!(extension = %ext, error = %e, "Extension setup failed");
            }
        }
    }

    for ddl in &secret_ddl {
        if let Err(e) = conn.execute_batch(ddl) {
            tracing::warn!(error = %e, "Secret DDL failed");
        }
    }

    let mut results = serde_json::Map::new();
    let mut excel_exports: Vec<Value> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for (i, stmt) in statements.iter().enumerate() {
        let key = format!("command_{}", i);

        if let Some((rewritten, upload)) = rewrite_xlsx_copy(stmt) {
            for setup in ["INSTALL excel;", "LOAD excel;"] {
                if let Err(e) = conn.execute_batch(setup) {
                    tracing::warn!(error = %e, "Excel extension setup failed");
                }
            }
            match conn.execute_batch(&rewritten) {
                Ok(()) => {
                    results.insert(key, serde_json::json!({"status": "success", "excel_export": upload.destination}));
                    excel_exports.push(serde_json::json!({
                        "destination": upload.destination,
                        "local_path": upload.local_path,
                        "uploaded": false,
                    }));
                }
                Err(e) => {
                    let message = e.to_string();
                    results.insert(key, serde_json::json!({"status": "error", "message": message}));
                    errors.push(format!("statement {}: {}", i, message));
                }
            }
            continue;
        }

        if returns_rows(stmt) {
            match query_sample(&conn, stmt) {
                Ok((columns, rows)) => {
                    results.insert(
                        key,
                        serde_json::json!({
                            "status": "success",
                            "columns": columns,
                            "rows": rows,
                            "row_count": rows.len(),
                        }),
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    results.insert(key, serde_json::json!({"status": "error", "message": message}));
                    errors.push(format!("statement {}: {}", i, message));
                }
            }
        } else {
            match conn.execute_batch(stmt) {
                Ok(()) => {
                    results.insert(key, serde_json::json!({"status": "success"}));
                }
                Err(e) => {
                    let message = e.to_string();
                    results.insert(key, serde_json::json!({"status": "error", "message": message}));
                    errors.push(format!("statement {}: {}", i, message));
                }
            }
        }
    }

    Ok((Value::Object(results), excel_exports, errors))
}

/// Run a row-returning statement and collect a bounded sample.
fn query_sample(conn: &Connection, stmt: &str) -> Result<(Vec<String>, Vec<Value>), ToolError> {
    let mut prepared = conn.prepare(stmt)?;
    let mut rows_out: Vec<Value> = Vec::new();

    let mut rows = prepared.query([])?;
    let mut columns: Vec<String> = Vec::new();
    while let Some(row) = rows.next()? {
        if columns.is_empty() {
            columns = row
                .as_ref()
                .column_names()
                .iter()
                .map(|name| name.to_string())
                .collect();
        }
        if rows_out.len() >= SAMPLE_LIMIT {
            continue;
        }
        let mut obj = serde_json::Map::new();
        for (idx, name) in columns.iter().enumerate() {
            let value: duckdb::types::Value = row.get(idx)?;
            obj.insert(name.clone(), duck_value_to_json(value));
        }
        rows_out.push(Value::Object(obj));
    }

    Ok((columns, rows_out))
}

fn duck_value_to_json(value: duckdb::types::Value) -> Value {
    use duckdb::types::Value as Dv;
    match value {
        Dv::Null => Value::Null,
        Dv::Boolean(b) => serde_json::json!(b),
        Dv::TinyInt(v) => serde_json::json!(v),
        Dv::SmallInt(v) => serde_json::json!(v),
        Dv::Int(v) => serde_json::json!(v),
        Dv::BigInt(v) => serde_json::json!(v),
        Dv::UTinyInt(v) => serde_json::json!(v),
        Dv::USmallInt(v) => serde_json::json!(v),
        Dv::UInt(v) => serde_json::json!(v),
        Dv::UBigInt(v) => serde_json::json!(v),
        Dv::Float(v) => serde_json::json!(v),
        Dv::Double(v) => serde_json::json!(v),
        Dv::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(|f| serde_json::json!(f))
            .unwrap_or_else(|_| serde_json::json!(d.to_string())),
        Dv::Text(s) => Value::String(s),
        Dv::Blob(bytes) => serde_json::json!(BASE64.encode(bytes)),
        other => Value::String(format!("{:?}", other)),
    }
}

/// Normalize a credential name into a valid secret alias.
fn sanitize_alias(name: &str) -> String {
    let alias: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if alias.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("s_{}", alias)
    } else {
        alias
    }
}

/// Decode a command that may be base64-encoded SQL.
fn decode_command(raw: &str) -> String {
    if let Ok(bytes) = BASE64.decode(raw.trim().as_bytes()) {
        if let Ok(text) = String::from_utf8(bytes) {
            if text.chars().any(|c| c.is_whitespace()) || text.len() > 16 {
                return text;
            }
        }
    }
    raw.to_string()
}

fn returns_rows(stmt: &str) -> bool {
    let upper = stmt.trim_start().to_uppercase();
    ["SELECT", "WITH", "SHOW", "DESCRIBE", "PRAGMA", "FROM"]
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

/// Rewrite a `COPY ... TO '<cloud-url>' (FORMAT 'xlsx')` statement to export
/// into a local workbook file, returning the deferred upload.
fn rewrite_xlsx_copy(stmt: &str) -> Option<(String, PendingUpload)> {
    let re = regex::Regex::new(
        r"(?is)^COPY\s+.+\s+TO\s+'([^']+)'\s*\(([^)]*FORMAT\s+'?xlsx'?[^)]*)\)",
    )
    .ok()?;
    let caps = re.captures(stmt.trim())?;
    let destination = caps.get(1)?.as_str().to_string();

    if !(destination.starts_with("gs://")
        || destination.starts_with("gcs://")
        || destination.starts_with("s3://"))
    {
        return None;
    }

    let file_name = destination
        .rsplit('/')
        .next()
        .unwrap_or("export.xlsx")
        .to_string();
    let local_path = std::env::temp_dir()
        .join(format!("noetl_{}_{}", uuid::Uuid::new_v4(), file_name))
        .to_string_lossy()
        .to_string();

    let rewritten = stmt.replacen(&destination, &local_path, 1);

    Some((
        rewritten,
        PendingUpload {
            destination,
            local_path,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialSource;

    fn tool() -> DuckdbTool {
        DuckdbTool::new(Arc::new(AuthResolver::new(Arc::new(
            MemoryCredentialSource::new(),
        ))))
    }

    #[tokio::test]
    async fn test_basic_query() {
        let config = ToolConfig::new(
            "duckdb",
            serde_json::json!({"command": "SELECT 1 AS one, 'x' AS label;"}),
        );
        let ctx = ExecutionContext::default();

        let result = tool().execute(&config, &ctx).await.unwrap();
        assert!(result.is_success());
        let data = result.data.unwrap();
        let cmd = &data["results"]["command_0"];
        assert_eq!(cmd["rows"][0]["one"], serde_json::json!(1));
        assert_eq!(cmd["rows"][0]["label"], serde_json::json!("x"));
    }

    #[tokio::test]
    async fn test_create_insert_select() {
        let sql = r#"
            CREATE TABLE t (id INTEGER, name VARCHAR);
            INSERT INTO t VALUES (1, 'a'), (2, 'b');
            SELECT count(*) AS n FROM t;
        "#;
        let config = ToolConfig::new("duckdb", serde_json::json!({"command": sql}));
        let ctx = ExecutionContext::default();

        let result = tool().execute(&config, &ctx).await.unwrap();
        assert!(result.is_success());
        let data = result.data.unwrap();
        assert_eq!(
            data["results"]["command_2"]["rows"][0]["n"],
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn test_failed_statement_reports_but_continues() {
        let sql = "SELECT * FROM missing_table; SELECT 2 AS ok;";
        let config = ToolConfig::new("duckdb", serde_json::json!({"command": sql}));
        let ctx = ExecutionContext::default();

        let result = tool().execute(&config, &ctx).await.unwrap();
        assert!(!result.is_success());
        let data = result.data.unwrap();
        assert_eq!(
            data["results"]["command_0"]["status"],
            serde_json::json!("error")
        );
        assert_eq!(
            data["results"]["command_1"]["rows"][0]["ok"],
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn test_templates_render_in_commands() {
        let config = ToolConfig::new(
            "duckdb",
            serde_json::json!({"command": "SELECT {{ n }} AS n;"}),
        );
        let mut ctx = ExecutionContext::default();
        ctx.set("n", serde_json::json!(7));

        let result = tool().execute(&config, &ctx).await.unwrap();
        let data = result.data.unwrap();
        assert_eq!(
            data["results"]["command_0"]["rows"][0]["n"],
            serde_json::json!(7)
        );
    }

    #[tokio::test]
    async fn test_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("task.duckdb").to_string_lossy().to_string();

        let config = ToolConfig::new(
            "duckdb",
            serde_json::json!({
                "database": db_path,
                "command": "CREATE TABLE IF NOT EXISTS t (v INTEGER); INSERT INTO t VALUES (9);"
            }),
        );
        let result = tool().execute(&config, &ExecutionContext::default()).await.unwrap();
        assert!(result.is_success());

        // a fresh task over the same file sees the committed rows
        let config = ToolConfig::new(
            "duckdb",
            serde_json::json!({
                "database": dir.path().join("task.duckdb").to_string_lossy(),
                "command": "SELECT v FROM t;"
            }),
        );
        let result = tool().execute(&config, &ExecutionContext::default()).await.unwrap();
        let data = result.data.unwrap();
        assert_eq!(
            data["results"]["command_0"]["rows"][0]["v"],
            serde_json::json!(9)
        );
    }

    #[test]
    fn test_rewrite_xlsx_copy() {
        let stmt = "COPY report TO 'gs://bucket/reports/q1.xlsx' (FORMAT 'xlsx', HEADER true)";
        let (rewritten, upload) = rewrite_xlsx_copy(stmt).unwrap();
        assert!(rewritten.contains("q1.xlsx"));
        assert!(!rewritten.contains("gs://"));
        assert_eq!(upload.destination, "gs://bucket/reports/q1.xlsx");

        // local destinations pass through untouched
        assert!(rewrite_xlsx_copy("COPY t TO '/tmp/x.xlsx' (FORMAT 'xlsx')").is_none());
        // other formats are not intercepted
        assert!(rewrite_xlsx_copy("COPY t TO 'gs://b/x.parquet' (FORMAT 'parquet')").is_none());
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  with x as (select 1) select * from x"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("CREATE TABLE t (a int)"));
    }
}
