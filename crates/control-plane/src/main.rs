//! NoETL Control Plane Server
//!
//! Serves the catalog, credential, execution, and event APIs and runs the
//! execution engine for launched playbooks.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_control_plane::{
    config::{AppConfig, DatabaseConfig},
    crypto::Encryptor,
    db::{connect_with_retry, DbPool},
    engine::{EventLog, PgEventLog},
    handlers,
    services::{CatalogService, CredentialService},
    state::AppState,
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,noetl_control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application router with all routes.
fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/catalog/register", post(handlers::catalog::register))
        .route("/catalog/list", get(handlers::catalog::list))
        .route("/catalog/{*rest}", get(handlers::catalog::fetch))
        .route(
            "/credentials",
            post(handlers::credentials::create_or_update).get(handlers::credentials::list),
        )
        .route("/credentials/{name}", get(handlers::credentials::get))
        .route("/agent/execute", post(handlers::execute::execute))
        .route(
            "/agent/execute-async",
            post(handlers::execute::execute_async),
        )
        .route("/events", get(handlers::events::list))
        .route("/events/{event_id}", get(handlers::events::get))
        .route("/executions", get(handlers::executions::list))
        .route("/executions/{execution_id}", get(handlers::executions::get))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_state(db: DbPool, config: AppConfig) -> anyhow::Result<AppState> {
    let key = config
        .encryption_key
        .clone()
        .unwrap_or_else(Encryptor::generate_key_base64);
    if config.encryption_key.is_none() {
        tracing::warn!("NOETL_ENCRYPTION_KEY not set; using an ephemeral key");
    }
    let encryptor = Encryptor::from_base64(&key)?;

    let catalog = CatalogService::new(db.clone());
    let credentials = CredentialService::new(db.clone(), encryptor);
    let log: Arc<dyn EventLog> = Arc::new(PgEventLog::new(db.clone()));

    Ok(AppState::new(db, config, catalog, credentials, log))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let app_config = AppConfig::from_env()?;
    let db_config = DatabaseConfig::from_env()?;

    let db = connect_with_retry(&db_config).await?;
    noetl_control_plane::db::ensure_schema(&db).await?;
    let bind_address = app_config.bind_address();
    let state = build_state(db, app_config)?;
    let router = build_router(state);

    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "NoETL control plane listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
    }
    tracing::info!("Shutdown signal received");
}
