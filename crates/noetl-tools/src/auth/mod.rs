//! Credential and authentication resolution.
//!
//! Plugins hand their `auth` block to the resolver, which turns symbolic
//! references into concrete secret payloads: connection parameters for
//! postgres, request headers for HTTP, `CREATE SECRET` DDL for DuckDB.

mod gcp;
mod resolver;
pub mod secrets;

pub use gcp::GcpAuth;
pub use resolver::{
    http_headers, normalize_legacy_auth, postgres_params, AuthMode, AuthResolver, Credential,
    CredentialSource, MemoryCredentialSource, PgConnectionParams, ResolvedAuth, ResolvedAuthSet,
};
