//! DuckDB `CREATE SECRET` DDL generation.
//!
//! Each resolved auth item translates to the DDL for its provider: GCS
//! (HMAC interop keys), S3, postgres attachment, or snowflake. Statements
//! include the extension INSTALL/LOAD needed for the secret type.

use std::collections::BTreeSet;

use crate::auth::ResolvedAuth;
use crate::error::ToolError;

/// Escape a value for inclusion in a single-quoted SQL literal.
pub fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}

/// DuckDB extensions required by a set of resolved auth items.
pub fn required_extensions<'a>(auths: impl IntoIterator<Item = &'a ResolvedAuth>) -> Vec<String> {
    let mut extensions = BTreeSet::new();
    for auth in auths {
        match auth.service.as_str() {
            "gcs" | "gcs_hmac" | "s3" => {
                extensions.insert("httpfs".to_string());
            }
            "postgres" => {
                extensions.insert("postgres".to_string());
            }
            "mysql" => {
                extensions.insert("mysql".to_string());
            }
            "snowflake" => {
                extensions.insert("snowflake".to_string());
            }
            _ => {}
        }
    }
    extensions.into_iter().collect()
}

/// Generate the statements that register one resolved auth item as a DuckDB
/// secret.
pub fn secret_statements(alias: &str, auth: &ResolvedAuth) -> Result<Vec<String>, ToolError> {
    match auth.service.as_str() {
        "gcs" | "gcs_hmac" => gcs_secret(alias, auth),
        "s3" => s3_secret(alias, auth),
        "postgres" => postgres_secret(alias, auth),
        "snowflake" => snowflake_secret(alias, auth),
        other => Err(ToolError::Auth(format!(
            "No DuckDB secret mapping for credential type '{}'",
            other
        ))),
    }
}

/// Scan SQL text for cloud bucket scopes (`gs://`, `gcs://`, `s3://`).
///
/// Returned scopes are normalized with a trailing slash for prefix matching
/// and deduplicated in first-seen order.
pub fn scan_bucket_scopes(sql: &str) -> Vec<String> {
    let Ok(re) = regex::Regex::new(r"(?i)\b(gs|gcs|s3)://([A-Za-z0-9._\-]+)") else {
        return Vec::new();
    };

    let mut seen = BTreeSet::new();
    let mut scopes = Vec::new();
    for caps in re.captures_iter(sql) {
        let scheme = caps[1].to_lowercase();
        // gcs:// is an accepted spelling of gs://
        let scheme = if scheme == "gcs" { "gs".to_string() } else { scheme };
        let scope = format!("{}://{}/", scheme, &caps[2]);
        if seen.insert(scope.clone()) {
            scopes.push(scope);
        }
    }
    scopes
}

/// Whether a scope is covered by any of the given secret scopes.
pub fn scope_covered(scope: &str, covered: &[Option<String>]) -> bool {
    covered.iter().any(|c| match c {
        Some(prefix) => scope.starts_with(prefix.trim_end_matches('/')),
        None => false,
    })
}

fn gcs_secret(alias: &str, auth: &ResolvedAuth) -> Result<Vec<String>, ToolError> {
    let key_id = auth.field(&["key_id", "access_key_id"]);
    let secret = auth.field(&["secret_key", "secret", "secret_access_key"]);

    let (Some(key_id), Some(secret)) = (key_id, secret) else {
        return Err(ToolError::Auth(format!(
            "GCS secret '{}' missing key_id/secret_key",
            alias
        )));
    };

    let mut parts = vec![
        "TYPE gcs".to_string(),
        format!("KEY_ID '{}'", escape_sql(&key_id)),
        format!("SECRET '{}'", escape_sql(&secret)),
    ];
    if let Some(scope) = normalized_scope(auth, "gs://") {
        parts.push(format!("SCOPE '{}'", escape_sql(&scope)));
    }

    Ok(vec![
        "INSTALL httpfs;".to_string(),
        "LOAD httpfs;".to_string(),
        format!("CREATE OR REPLACE SECRET {} ({});", alias, parts.join(", ")),
    ])
}

fn s3_secret(alias: &str, auth: &ResolvedAuth) -> Result<Vec<String>, ToolError> {
    let key_id = auth.field(&["access_key_id", "key_id"]);
    let secret = auth.field(&["secret_access_key", "secret_key", "secret"]);

    let (Some(key_id), Some(secret)) = (key_id, secret) else {
        return Err(ToolError::Auth(format!(
            "S3 secret '{}' missing access_key_id/secret_access_key",
            alias
        )));
    };

    let mut parts = vec![
        "TYPE s3".to_string(),
        format!("KEY_ID '{}'", escape_sql(&key_id)),
        format!("SECRET '{}'", escape_sql(&secret)),
    ];
    if let Some(region) = auth.field(&["region"]) {
        parts.push(format!("REGION '{}'", escape_sql(&region)));
    }
    if let Some(endpoint) = auth.field(&["endpoint"]) {
        parts.push(format!("ENDPOINT '{}'", escape_sql(&endpoint)));
    }
    if let Some(scope) = normalized_scope(auth, "s3://") {
        parts.push(format!("SCOPE '{}'", escape_sql(&scope)));
    }

    Ok(vec![
        "INSTALL httpfs;".to_string(),
        "LOAD httpfs;".to_string(),
        format!("CREATE OR REPLACE SECRET {} ({});", alias, parts.join(", ")),
    ])
}

fn postgres_secret(alias: &str, auth: &ResolvedAuth) -> Result<Vec<String>, ToolError> {
    let host = auth.field(&["host", "db_host"]);
    let database = auth.field(&["database", "dbname", "db_name"]);
    let user = auth.field(&["user", "username", "db_user"]);
    let password = auth.field(&["password", "db_password"]);

    for (name, value) in [
        ("host", &host),
        ("database", &database),
        ("user", &user),
        ("password", &password),
    ] {
        if value.is_none() {
            return Err(ToolError::Auth(format!(
                "Postgres secret '{}' missing required field: {}",
                alias, name
            )));
        }
    }

    let port = auth
        .field(&["port", "db_port"])
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(5432);

    let mut parts = vec![
        "TYPE postgres".to_string(),
        format!("HOST '{}'", escape_sql(&host.unwrap_or_default())),
        format!("PORT {}", port),
        format!("DATABASE '{}'", escape_sql(&database.unwrap_or_default())),
        format!("USER '{}'", escape_sql(&user.unwrap_or_default())),
        format!("PASSWORD '{}'", escape_sql(&password.unwrap_or_default())),
    ];
    if let Some(sslmode) = auth.field(&["sslmode"]) {
        parts.push(format!("SSLMODE '{}'", escape_sql(&sslmode)));
    }

    Ok(vec![
        "INSTALL postgres;".to_string(),
        "LOAD postgres;".to_string(),
        format!("CREATE OR REPLACE SECRET {} ({});", alias, parts.join(", ")),
    ])
}

fn snowflake_secret(alias: &str, auth: &ResolvedAuth) -> Result<Vec<String>, ToolError> {
    let account = auth.field(&["account", "sf_account"]);
    let user = auth.field(&["user", "username", "sf_user"]);
    let password = auth.field(&["password", "sf_password"]);

    let (Some(account), Some(user), Some(password)) = (account, user, password) else {
        return Err(ToolError::Auth(format!(
            "Snowflake secret '{}' missing account/user/password",
            alias
        )));
    };

    let mut parts = vec![
        "TYPE snowflake".to_string(),
        format!("ACCOUNT '{}'", escape_sql(&account)),
        format!("USER '{}'", escape_sql(&user)),
        format!("PASSWORD '{}'", escape_sql(&password)),
    ];
    for (clause, names) in [
        ("DATABASE", ["database", "sf_database"]),
        ("SCHEMA", ["schema", "sf_schema"]),
        ("WAREHOUSE", ["warehouse", "sf_warehouse"]),
        ("ROLE", ["role", "sf_role"]),
    ] {
        if let Some(value) = auth.field(&names) {
            parts.push(format!("{} '{}'", clause, escape_sql(&value)));
        }
    }

    Ok(vec![
        "INSTALL snowflake FROM community;".to_string(),
        "LOAD snowflake;".to_string(),
        format!("CREATE OR REPLACE SECRET {} ({});", alias, parts.join(", ")),
    ])
}

/// Scope from the auth item, normalized with a trailing slash.
fn normalized_scope(auth: &ResolvedAuth, scheme: &str) -> Option<String> {
    let scope = auth.scope.clone()?;
    if scope.starts_with(scheme) && !scope.ends_with('/') {
        Some(format!("{}/", scope))
    } else {
        Some(scope)
    }
}
