//! Credential service.
//!
//! Stores named credential bundles with AES-GCM encrypted payloads and
//! serves them decrypted to the auth resolver.

use async_trait::async_trait;
use chrono::Utc;
use noetl_tools::auth::{Credential, CredentialSource};
use noetl_tools::ToolError;

use crate::crypto::Encryptor;
use crate::db::models::{CredentialRecord, CredentialRequest, CredentialResponse};
use crate::db::queries::credential as queries;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};

/// Service for credential operations.
#[derive(Clone)]
pub struct CredentialService {
    pool: DbPool,
    encryptor: Encryptor,
}

impl CredentialService {
    pub fn new(pool: DbPool, encryptor: Encryptor) -> Self {
        Self { pool, encryptor }
    }

    /// Create or update a credential, encrypting its payload.
    pub async fn upsert(&self, request: CredentialRequest) -> AppResult<CredentialResponse> {
        if request.name.trim().is_empty() {
            return Err(AppError::Validation("Credential requires a name".to_string()));
        }

        let now = Utc::now();
        let record = CredentialRecord {
            name: request.name.clone(),
            credential_type: request.credential_type.clone(),
            data_encrypted: self.encryptor.encrypt_json(&request.data)?,
            meta: request.meta.clone(),
            tags: request.tags.clone(),
            description: request.description.clone(),
            created_at: now,
            updated_at: now,
        };

        queries::upsert_credential(&self.pool, &record).await?;
        tracing::info!(name = %request.name, credential_type = %request.credential_type, "Stored credential");

        Ok(CredentialResponse {
            name: record.name,
            credential_type: record.credential_type,
            data: None,
            meta: record.meta,
            tags: record.tags,
            description: record.description,
            created_at: record.created_at,
        })
    }

    /// Fetch a credential; `include_data` decrypts the payload.
    pub async fn get(&self, name: &str, include_data: bool) -> AppResult<CredentialResponse> {
        let record = queries::by_name(&self.pool, name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Credential '{}' not found", name)))?;

        let data = if include_data {
            Some(self.encryptor.decrypt_json(&record.data_encrypted)?)
        } else {
            None
        };

        Ok(CredentialResponse {
            name: record.name,
            credential_type: record.credential_type,
            data,
            meta: record.meta,
            tags: record.tags,
            description: record.description,
            created_at: record.created_at,
        })
    }

    /// List credentials without payloads.
    pub async fn list(&self) -> AppResult<Vec<CredentialResponse>> {
        let records = queries::list_credentials(&self.pool).await?;
        Ok(records
            .into_iter()
            .map(|record| CredentialResponse {
                name: record.name,
                credential_type: record.credential_type,
                data: None,
                meta: record.meta,
                tags: record.tags,
                description: record.description,
                created_at: record.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl CredentialSource for CredentialService {
    async fn fetch(&self, name: &str) -> Result<Credential, ToolError> {
        let response = self
            .get(name, true)
            .await
            .map_err(|e| ToolError::Auth(e.to_string()))?;

        Ok(Credential {
            name: response.name,
            kind: response.credential_type,
            data: response.data.unwrap_or(serde_json::Value::Null),
        })
    }
}
