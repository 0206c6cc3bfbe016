//! AES-256-GCM encryption for credential data at rest.
//!
//! Credential payloads are stored as base64 of `nonce || ciphertext`. The
//! key comes from `NOETL_ENCRYPTION_KEY` (base64, 32 bytes).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;

use crate::error::{AppError, AppResult};

/// Nonce size for AES-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256.
const KEY_SIZE: usize = 32;

/// Encryptor for credential data.
#[derive(Clone)]
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// Create an encryptor from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> AppResult<Self> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|e| AppError::Encryption(format!("Invalid base64 key: {}", e)))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(AppError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| AppError::Encryption(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Generate a new random key as base64.
    pub fn generate_key_base64() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt a JSON payload to base64 of `nonce || ciphertext`.
    pub fn encrypt_json(&self, data: &serde_json::Value) -> AppResult<String> {
        let plaintext = serde_json::to_vec(data)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt a base64 `nonce || ciphertext` blob back to JSON.
    pub fn decrypt_json(&self, encoded: &str) -> AppResult<serde_json::Value> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| AppError::Encryption(format!("Invalid base64 ciphertext: {}", e)))?;

        if combined.len() < NONCE_SIZE {
            return Err(AppError::Encryption(
                "Ciphertext too short (missing nonce)".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| AppError::Encryption(format!("Decryption failed: {}", e)))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_json() {
        let key = Encryptor::generate_key_base64();
        let encryptor = Encryptor::from_base64(&key).unwrap();

        let data = serde_json::json!({
            "user": "admin",
            "password": "secret123",
            "host": "db.example.com"
        });

        let encoded = encryptor.encrypt_json(&data).unwrap();
        assert_ne!(encoded, data.to_string());

        let decrypted = encryptor.decrypt_json(&encoded).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_distinct_nonces() {
        let key = Encryptor::generate_key_base64();
        let encryptor = Encryptor::from_base64(&key).unwrap();
        let data = serde_json::json!({"x": 1});

        let a = encryptor.encrypt_json(&data).unwrap();
        let b = encryptor.encrypt_json(&data).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_key() {
        assert!(Encryptor::from_base64("short").is_err());
        let wrong_size = BASE64.encode([0u8; 16]);
        assert!(Encryptor::from_base64(&wrong_size).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = Encryptor::generate_key_base64();
        let encryptor = Encryptor::from_base64(&key).unwrap();

        let encoded = encryptor.encrypt_json(&serde_json::json!({"a": 1})).unwrap();
        let mut bytes = BASE64.decode(&encoded).unwrap();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xFF;
        }
        let tampered = BASE64.encode(bytes);

        assert!(encryptor.decrypt_json(&tampered).is_err());
    }
}
