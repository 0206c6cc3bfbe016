//! Database configuration.

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;

/// Database configuration loaded from `POSTGRES_`-prefixed environment
/// variables, with `NOETL_PGDB` (a libpq-style URL) taking precedence.
///
/// - `POSTGRES_HOST` (default "localhost"), `POSTGRES_PORT` (default 5432)
/// - `POSTGRES_USER`, `POSTGRES_PASSWORD`, `POSTGRES_DB`
/// - `NOETL_SCHEMA`: schema for control-plane tables (default "noetl")
/// - `NOETL_DB_STARTUP_TIMEOUT`: seconds to keep retrying the first connect
/// - `NOETL_DB_RETRY_INTERVAL`: seconds between startup retries
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database", alias = "database")]
    pub db: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "noetl".to_string()
}

fn default_database() -> String {
    "noetl".to_string()
}

fn default_max_connections() -> u32 {
    10
}

impl DatabaseConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POSTGRES_").from_env::<DatabaseConfig>()
    }

    /// The schema for control-plane tables (`NOETL_SCHEMA`).
    pub fn schema() -> String {
        std::env::var("NOETL_SCHEMA").unwrap_or_else(|_| "noetl".to_string())
    }

    /// A full connection URL from `NOETL_PGDB`, when set.
    pub fn url_override() -> Option<String> {
        std::env::var("NOETL_PGDB").ok().filter(|s| !s.is_empty())
    }

    /// How long to keep retrying the initial connection.
    pub fn startup_timeout() -> Duration {
        let secs = std::env::var("NOETL_DB_STARTUP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        Duration::from_secs(secs)
    }

    /// Delay between startup retries.
    pub fn retry_interval() -> Duration {
        let secs = std::env::var("NOETL_DB_RETRY_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);
        Duration::from_secs(secs)
    }

    /// PostgreSQL connection options.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.db)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            db: default_database(),
            max_connections: default_max_connections(),
        }
    }
}
