//! Schema bootstrap.
//!
//! Creates the control-plane tables on startup when they are missing. The
//! engine only depends on the append/range/filter operations; this layout is
//! an implementation detail.

use crate::db::DbPool;
use crate::error::AppResult;

const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS noetl",
    r#"
    CREATE TABLE IF NOT EXISTS noetl.event_log (
        execution_id    BIGINT NOT NULL,
        event_id        BIGINT NOT NULL,
        parent_event_id BIGINT,
        event_type      TEXT NOT NULL,
        node_id         TEXT,
        node_name       TEXT,
        node_type       TEXT,
        status          TEXT NOT NULL,
        duration_ms     BIGINT,
        input_context   JSONB,
        output_result   JSONB,
        metadata        JSONB,
        error           TEXT,
        loop_id         TEXT,
        loop_name       TEXT,
        iterator        TEXT,
        items           JSONB,
        current_index   BIGINT,
        current_item    JSONB,
        results         JSONB,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (execution_id, event_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS event_log_type_idx ON noetl.event_log (execution_id, event_type)",
    "CREATE INDEX IF NOT EXISTS event_log_loop_idx ON noetl.event_log (execution_id, loop_name)",
    r#"
    CREATE TABLE IF NOT EXISTS noetl.catalog (
        resource_path    TEXT NOT NULL,
        resource_version TEXT NOT NULL,
        resource_type    TEXT NOT NULL,
        content          TEXT NOT NULL,
        payload          JSONB,
        meta             JSONB,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (resource_path, resource_version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.credential (
        name            TEXT PRIMARY KEY,
        credential_type TEXT NOT NULL,
        data_encrypted  TEXT NOT NULL,
        meta            JSONB,
        tags            JSONB,
        description     TEXT,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.transition (
        execution_id BIGINT NOT NULL,
        from_step    TEXT NOT NULL,
        to_step      TEXT NOT NULL,
        condition    TEXT,
        with_params  JSONB,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS transition_execution_idx ON noetl.transition (execution_id)",
];

/// Create the schema and tables when absent.
pub async fn ensure_schema(pool: &DbPool) -> AppResult<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema verified");
    Ok(())
}
