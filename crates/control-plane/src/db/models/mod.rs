//! Database models.

pub mod catalog;
pub mod credential;
pub mod event;
pub mod transition;

pub use catalog::{CatalogEntry, CatalogRegisterRequest, CatalogRegisterResponse};
pub use credential::{CredentialRecord, CredentialRequest, CredentialResponse};
pub use event::EventRecord;
pub use transition::TransitionRecord;
