//! Credential encryption.

mod encryption;

pub use encryption::Encryptor;
