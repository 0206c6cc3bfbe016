//! Transition table queries.

use crate::db::models::TransitionRecord;
use crate::db::DbPool;
use crate::error::AppResult;

/// Record a taken transition.
pub async fn insert_transition(pool: &DbPool, record: &TransitionRecord) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.transition (
            execution_id, from_step, to_step, condition, with_params, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.execution_id)
    .bind(&record.from_step)
    .bind(&record.to_step)
    .bind(&record.condition)
    .bind(&record.with_params)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// All transitions for an execution in taken order.
pub async fn by_execution(pool: &DbPool, execution_id: i64) -> AppResult<Vec<TransitionRecord>> {
    let records = sqlx::query_as::<_, TransitionRecord>(
        r#"
        SELECT execution_id, from_step, to_step, condition, with_params, created_at
        FROM noetl.transition
        WHERE execution_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}
