//! GCP token acquisition.
//!
//! Tokens come either from a service-account JSON carried in a resolved
//! credential payload, or from Application Default Credentials (environment,
//! gcloud configuration, metadata service).

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::ToolError;

/// Default scopes for storage uploads and general cloud access.
pub const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// GCP token provider with a lazily-initialized ADC chain.
pub struct GcpAuth {
    provider: Arc<RwLock<Option<Arc<dyn gcp_auth::TokenProvider>>>>,
}

impl GcpAuth {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(RwLock::new(None)),
        }
    }

    /// Get a token from an inline service-account JSON document.
    pub async fn token_from_service_account(
        &self,
        service_account_json: &str,
        scopes: &[&str],
    ) -> Result<String, ToolError> {
        let account = gcp_auth::CustomServiceAccount::from_json(service_account_json)
            .map_err(|e| ToolError::Auth(format!("Invalid service account JSON: {}", e)))?;
        let provider: Arc<dyn gcp_auth::TokenProvider> = Arc::new(account);
        let token = provider
            .token(scopes)
            .await
            .map_err(|e| ToolError::Auth(format!("Failed to get GCP token: {}", e)))?;
        Ok(token.as_str().to_string())
    }

    /// Get a token via the default provider chain.
    pub async fn token(&self, scopes: &[&str]) -> Result<String, ToolError> {
        self.ensure_provider().await?;

        let guard = self.provider.read().await;
        let provider = guard
            .as_ref()
            .ok_or_else(|| ToolError::Auth("GCP provider not initialized".to_string()))?;

        let token = provider
            .token(scopes)
            .await
            .map_err(|e| ToolError::Auth(format!("Failed to get GCP token: {}", e)))?;

        Ok(token.as_str().to_string())
    }

    async fn ensure_provider(&self) -> Result<(), ToolError> {
        {
            let guard = self.provider.read().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        let provider = gcp_auth::provider()
            .await
            .map_err(|e| ToolError::Auth(format!("Failed to initialize GCP auth: {}", e)))?;

        let mut guard = self.provider.write().await;
        *guard = Some(provider);
        Ok(())
    }
}

impl Default for GcpAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for GcpAuth {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scopes() {
        assert!(DEFAULT_SCOPES.contains(&"https://www.googleapis.com/auth/cloud-platform"));
    }

    #[tokio::test]
    async fn test_invalid_service_account_json() {
        let auth = GcpAuth::new();
        let result = auth
            .token_from_service_account("not json", DEFAULT_SCOPES)
            .await;
        assert!(matches!(result, Err(ToolError::Auth(_))));
    }
}
