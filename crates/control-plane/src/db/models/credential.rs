//! Credential models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored credential row; `data_encrypted` is base64 of nonce+ciphertext.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub name: String,

    /// Handler selector ("postgres", "gcs", "gcs_hmac", "s3", "snowflake", ...).
    pub credential_type: String,

    /// Encrypted type-specific payload.
    pub data_encrypted: String,

    pub meta: Option<serde_json::Value>,

    pub tags: Option<serde_json::Value>,

    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Request body for credential create/update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub name: String,

    #[serde(rename = "type")]
    pub credential_type: String,

    /// Plaintext payload; encrypted before storage.
    pub data: serde_json::Value,

    #[serde(default)]
    pub meta: Option<serde_json::Value>,

    #[serde(default)]
    pub tags: Option<serde_json::Value>,

    #[serde(default)]
    pub description: Option<String>,
}

/// API response for a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialResponse {
    pub name: String,

    #[serde(rename = "type")]
    pub credential_type: String,

    /// Decrypted payload, present only when explicitly requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization() {
        let json = serde_json::json!({
            "name": "pg_local",
            "type": "postgres",
            "data": {"host": "localhost", "password": "x"},
            "tags": ["dev"]
        });
        let request: CredentialRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.name, "pg_local");
        assert_eq!(request.credential_type, "postgres");
    }

    #[test]
    fn test_response_skips_data_when_none() {
        let response = CredentialResponse {
            name: "x".to_string(),
            credential_type: "s3".to_string(),
            data: None,
            meta: None,
            tags: None,
            description: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("\"data\""));
    }
}
