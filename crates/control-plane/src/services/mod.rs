//! Service layer over the database.

pub mod catalog;
pub mod credential;
pub mod execution;

pub use catalog::CatalogService;
pub use credential::CredentialService;
pub use execution::ExecutionService;
