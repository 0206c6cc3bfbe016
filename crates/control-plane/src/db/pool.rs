//! Database connection pool management.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Type alias for the PostgreSQL connection pool.
pub type DbPool = PgPool;

/// Create a new database connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30));

    let pool = match DatabaseConfig::url_override() {
        Some(url) => options.connect(&url).await?,
        None => options.connect_with(config.connect_options()).await?,
    };

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.db,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Connect with a bounded startup retry loop.
///
/// Retries every `NOETL_DB_RETRY_INTERVAL` seconds until
/// `NOETL_DB_STARTUP_TIMEOUT` elapses; the last error is returned so the
/// server can decide to start degraded or abort.
pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let deadline = std::time::Instant::now() + DatabaseConfig::startup_timeout();
    let interval = DatabaseConfig::retry_interval();

    loop {
        match create_pool(config).await {
            Ok(pool) => return Ok(pool),
            Err(e) if std::time::Instant::now() < deadline => {
                tracing::warn!(error = %e, retry_in = ?interval, "Database not ready, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if the database connection is healthy.
pub async fn health_check(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
