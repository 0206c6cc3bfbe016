//! Task plugin implementations.

pub mod code;
pub mod duckdb;
pub mod http;
pub mod postgres;
pub mod transfer;

pub use code::CodeTool;
pub use duckdb::DuckdbTool;
pub use http::{HttpTool, MockResponse, MockTransport};
pub use postgres::PostgresTool;
pub use transfer::TransferTool;
