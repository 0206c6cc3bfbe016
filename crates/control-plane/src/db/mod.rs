//! Database connectivity, models, and queries (PostgreSQL via SQLx).

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{connect_with_retry, create_pool, DbPool};
pub use schema::ensure_schema;
