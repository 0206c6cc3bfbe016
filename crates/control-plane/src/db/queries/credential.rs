//! Credential queries.

use crate::db::models::CredentialRecord;
use crate::db::DbPool;
use crate::error::AppResult;

const CREDENTIAL_COLUMNS: &str =
    "name, credential_type, data_encrypted, meta, tags, description, created_at, updated_at";

/// Create or update a credential by name.
pub async fn upsert_credential(pool: &DbPool, record: &CredentialRecord) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.credential (
            name, credential_type, data_encrypted, meta, tags, description, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (name) DO UPDATE SET
            credential_type = EXCLUDED.credential_type,
            data_encrypted = EXCLUDED.data_encrypted,
            meta = EXCLUDED.meta,
            tags = EXCLUDED.tags,
            description = EXCLUDED.description,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&record.name)
    .bind(&record.credential_type)
    .bind(&record.data_encrypted)
    .bind(&record.meta)
    .bind(&record.tags)
    .bind(&record.description)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a credential by name.
pub async fn by_name(pool: &DbPool, name: &str) -> AppResult<Option<CredentialRecord>> {
    let record = sqlx::query_as::<_, CredentialRecord>(&format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS}
        FROM noetl.credential
        WHERE name = $1
        "#
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List all credentials, newest first.
pub async fn list_credentials(pool: &DbPool) -> AppResult<Vec<CredentialRecord>> {
    let records = sqlx::query_as::<_, CredentialRecord>(&format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS}
        FROM noetl.credential
        ORDER BY created_at DESC
        "#
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}
