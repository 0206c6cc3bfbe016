//! Catalog queries.

use crate::db::models::CatalogEntry;
use crate::db::DbPool;
use crate::error::AppResult;

const CATALOG_COLUMNS: &str =
    "resource_path, resource_version, resource_type, content, payload, meta, created_at";

/// Insert a catalog entry; uniqueness on `(resource_path, resource_version)`.
pub async fn insert_entry(pool: &DbPool, entry: &CatalogEntry) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.catalog (
            resource_path, resource_version, resource_type, content, payload, meta, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&entry.resource_path)
    .bind(&entry.resource_version)
    .bind(&entry.resource_type)
    .bind(&entry.content)
    .bind(&entry.payload)
    .bind(&entry.meta)
    .bind(entry.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// All versions registered for a path.
pub async fn versions_for_path(pool: &DbPool, path: &str) -> AppResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT resource_version
        FROM noetl.catalog
        WHERE resource_path = $1
        "#,
    )
    .bind(path)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(v,)| v).collect())
}

/// Fetch an entry by path and version.
pub async fn by_path_version(
    pool: &DbPool,
    path: &str,
    version: &str,
) -> AppResult<Option<CatalogEntry>> {
    let entry = sqlx::query_as::<_, CatalogEntry>(&format!(
        r#"
        SELECT {CATALOG_COLUMNS}
        FROM noetl.catalog
        WHERE resource_path = $1 AND resource_version = $2
        "#
    ))
    .bind(path)
    .bind(version)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// All entries for a path (callers pick the highest version triple).
pub async fn all_for_path(pool: &DbPool, path: &str) -> AppResult<Vec<CatalogEntry>> {
    let entries = sqlx::query_as::<_, CatalogEntry>(&format!(
        r#"
        SELECT {CATALOG_COLUMNS}
        FROM noetl.catalog
        WHERE resource_path = $1
        "#
    ))
    .bind(path)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// List entries ordered by insertion time descending, optionally by type.
pub async fn list_entries(
    pool: &DbPool,
    resource_type: Option<&str>,
) -> AppResult<Vec<CatalogEntry>> {
    let entries = if let Some(rt) = resource_type {
        sqlx::query_as::<_, CatalogEntry>(&format!(
            r#"
            SELECT {CATALOG_COLUMNS}
            FROM noetl.catalog
            WHERE resource_type = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(rt)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, CatalogEntry>(&format!(
            r#"
            SELECT {CATALOG_COLUMNS}
            FROM noetl.catalog
            ORDER BY created_at DESC
            "#
        ))
        .fetch_all(pool)
        .await?
    };

    Ok(entries)
}
