//! Local worker: run one playbook without a server.
//!
//! Events go to the in-memory log, or to Postgres when `--pgdb` and
//! `NOETL_PGDB` are set. There is no catalog here, so playbooks that resolve
//! named credentials should run through the server instead.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use noetl_control_plane::engine::{
    EngineOptions, EventLog, ExecutionEngine, FilePlaybookSource, MemoryEventLog, PgEventLog,
    PlaybookSource,
};
use noetl_tools::auth::MemoryCredentialSource;
use noetl_tools::tools::MockTransport;

/// Run a playbook file to completion and print the result map.
pub async fn run_worker(
    path: PathBuf,
    version: Option<String>,
    mock: bool,
    pgdb: bool,
    debug: bool,
) -> Result<()> {
    init_tracing(debug);

    let path_str = path.to_string_lossy().to_string();
    let playbook = FilePlaybookSource
        .load(&path_str, version.as_deref())
        .await
        .context("failed to load playbook")?;

    let log: Arc<dyn EventLog> = if pgdb {
        let url = std::env::var("NOETL_PGDB")
            .context("--pgdb requires NOETL_PGDB to be set")?;
        let pool = sqlx_pool(&url).await?;
        Arc::new(PgEventLog::new(pool))
    } else {
        Arc::new(MemoryEventLog::new())
    };

    let options = EngineOptions {
        max_transitions: None,
        http_mock: if mock {
            Some(Arc::new(MockTransport::with_defaults()))
        } else {
            None
        },
    };

    let engine = ExecutionEngine::new(
        playbook,
        Arc::clone(&log),
        Arc::new(MemoryCredentialSource::new()),
        options,
    );

    let execution_id = noetl_control_plane::engine::next_execution_id();
    let report = engine
        .run(execution_id, serde_json::json!({}))
        .await
        .context("execution failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status != "success" {
        anyhow::bail!(
            "execution {} finished with status '{}'",
            execution_id,
            report.status
        );
    }
    Ok(())
}

async fn sqlx_pool(url: &str) -> Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(url)
        .await
        .context("failed to connect to NOETL_PGDB")
}

fn init_tracing(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .try_init();
}
