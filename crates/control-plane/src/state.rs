//! Shared application state.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::engine::EventLog;
use crate::services::{CatalogService, CredentialService, ExecutionService};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: DbPool,

    /// Application configuration.
    pub config: Arc<AppConfig>,

    /// Catalog service.
    pub catalog: CatalogService,

    /// Credential service.
    pub credentials: CredentialService,

    /// Durable event log.
    pub log: Arc<dyn EventLog>,

    /// Execution summaries derived from the log.
    pub executions: ExecutionService,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        catalog: CatalogService,
        credentials: CredentialService,
        log: Arc<dyn EventLog>,
    ) -> Self {
        let executions = ExecutionService::new(Arc::clone(&log));
        Self {
            db,
            config: Arc::new(config),
            catalog,
            credentials,
            log,
            executions,
        }
    }
}
