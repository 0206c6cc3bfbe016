//! Application configuration.

use serde::Deserialize;

/// Application configuration loaded from `NOETL_`-prefixed environment
/// variables.
///
/// - `NOETL_HOST`: server bind address (default: "0.0.0.0")
/// - `NOETL_PORT`: server port (default: 8082)
/// - `NOETL_DEBUG`: enable debug mode
/// - `NOETL_ENCRYPTION_KEY`: base64 AES-256 key for credential storage
/// - `NOETL_MAX_TRANSITIONS`: step-transition bound per execution
/// - `NOETL_HTTP_MOCK_LOCAL`: force the HTTP mock transport
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Base64-encoded AES-256 key for credential encryption at rest
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Bound on step transitions per execution, guarding control-flow cycles
    #[serde(default = "default_max_transitions")]
    pub max_transitions: usize,

    /// Force the deterministic HTTP mock transport
    #[serde(default)]
    pub http_mock_local: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_max_transitions() -> usize {
    1000
}

impl AppConfig {
    /// Load configuration from `NOETL_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_").from_env::<AppConfig>()
    }

    /// The socket address string to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            encryption_key: None,
            max_transitions: default_max_transitions(),
            http_mock_local: false,
        }
    }
}
