//! Event log queries.
//!
//! Appends are single-row inserts; `event_id` is assigned from the current
//! per-execution maximum, and re-appending an existing `(execution_id,
//! event_id)` updates the row in place.

use crate::db::models::EventRecord;
use crate::db::DbPool;
use crate::error::AppResult;

const EVENT_COLUMNS: &str = r#"
    execution_id, event_id, parent_event_id, event_type,
    node_id, node_name, node_type, status, duration_ms,
    input_context, output_result, metadata, error,
    loop_id, loop_name, iterator, items, current_index, current_item, results,
    created_at
"#;

/// Insert a record with a pre-assigned `event_id`.
///
/// Fails with a unique violation when the id is already taken; callers that
/// race on id assignment retry with a fresh id.
pub async fn insert_event(pool: &DbPool, record: &EventRecord) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO noetl.event_log (
            execution_id, event_id, parent_event_id, event_type,
            node_id, node_name, node_type, status, duration_ms,
            input_context, output_result, metadata, error,
            loop_id, loop_name, iterator, items, current_index, current_item, results,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        RETURNING event_id
        "#,
    )
    .bind(record.execution_id)
    .bind(record.event_id)
    .bind(record.parent_event_id)
    .bind(&record.event_type)
    .bind(&record.node_id)
    .bind(&record.node_name)
    .bind(&record.node_type)
    .bind(&record.status)
    .bind(record.duration_ms)
    .bind(&record.input_context)
    .bind(&record.output_result)
    .bind(&record.metadata)
    .bind(&record.error)
    .bind(&record.loop_id)
    .bind(&record.loop_name)
    .bind(&record.iterator)
    .bind(&record.items)
    .bind(record.current_index)
    .bind(&record.current_item)
    .bind(&record.results)
    .bind(record.created_at)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Rewrite an existing `(execution_id, event_id)` row in place (idempotent
/// re-append, used for recovery rewrites).
pub async fn upsert_event(pool: &DbPool, record: &EventRecord) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO noetl.event_log (
            execution_id, event_id, parent_event_id, event_type,
            node_id, node_name, node_type, status, duration_ms,
            input_context, output_result, metadata, error,
            loop_id, loop_name, iterator, items, current_index, current_item, results,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        ON CONFLICT (execution_id, event_id) DO UPDATE SET
            status = EXCLUDED.status,
            duration_ms = EXCLUDED.duration_ms,
            output_result = EXCLUDED.output_result,
            metadata = EXCLUDED.metadata,
            error = EXCLUDED.error,
            results = EXCLUDED.results
        RETURNING event_id
        "#,
    )
    .bind(record.execution_id)
    .bind(record.event_id)
    .bind(record.parent_event_id)
    .bind(&record.event_type)
    .bind(&record.node_id)
    .bind(&record.node_name)
    .bind(&record.node_type)
    .bind(&record.status)
    .bind(record.duration_ms)
    .bind(&record.input_context)
    .bind(&record.output_result)
    .bind(&record.metadata)
    .bind(&record.error)
    .bind(&record.loop_id)
    .bind(&record.loop_name)
    .bind(&record.iterator)
    .bind(&record.items)
    .bind(record.current_index)
    .bind(&record.current_item)
    .bind(&record.results)
    .bind(record.created_at)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// The next `event_id` for an execution.
pub async fn next_event_id(pool: &DbPool, execution_id: i64) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(MAX(event_id), 0) + 1
        FROM noetl.event_log
        WHERE execution_id = $1
        "#,
    )
    .bind(execution_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// All events for an execution ordered by `event_id`.
pub async fn by_execution(pool: &DbPool, execution_id: i64) -> AppResult<Vec<EventRecord>> {
    let events = sqlx::query_as::<_, EventRecord>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM noetl.event_log
        WHERE execution_id = $1
        ORDER BY event_id ASC
        "#
    ))
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// One event by `(execution_id, event_id)`.
pub async fn by_event(
    pool: &DbPool,
    execution_id: i64,
    event_id: i64,
) -> AppResult<Option<EventRecord>> {
    let event = sqlx::query_as::<_, EventRecord>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM noetl.event_log
        WHERE execution_id = $1 AND event_id = $2
        "#
    ))
    .bind(execution_id)
    .bind(event_id)
    .fetch_optional(pool)
    .await?;

    Ok(event)
}

/// The last event for a loop within an execution.
pub async fn latest_by_loop(
    pool: &DbPool,
    execution_id: i64,
    loop_name: &str,
) -> AppResult<Option<EventRecord>> {
    let event = sqlx::query_as::<_, EventRecord>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM noetl.event_log
        WHERE execution_id = $1 AND loop_name = $2
        ORDER BY event_id DESC
        LIMIT 1
        "#
    ))
    .bind(execution_id)
    .bind(loop_name)
    .fetch_optional(pool)
    .await?;

    Ok(event)
}

/// Events filtered by type, ordered by `event_id`.
pub async fn by_type(
    pool: &DbPool,
    execution_id: i64,
    event_type: &str,
) -> AppResult<Vec<EventRecord>> {
    let events = sqlx::query_as::<_, EventRecord>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM noetl.event_log
        WHERE execution_id = $1 AND event_type = $2
        ORDER BY event_id ASC
        "#
    ))
    .bind(execution_id)
    .bind(event_type)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Distinct execution ids, newest first.
pub async fn list_executions(pool: &DbPool, limit: i64) -> AppResult<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT execution_id
        FROM noetl.event_log
        GROUP BY execution_id
        ORDER BY MIN(created_at) DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
