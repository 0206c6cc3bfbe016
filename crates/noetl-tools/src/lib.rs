//! NoETL Tool Library
//!
//! Shared runtime for playbook execution.
//!
//! This crate provides:
//! - Task plugins: http, postgres, duckdb, in-process code, transfer
//! - Template engine with Jinja2-compatible syntax and strict-undefined mode
//! - Credential/auth resolution (catalog credentials, HTTP headers, DuckDB secrets)
//! - The sink subsystem for declarative result persistence
//! - The iterator/loop controller with sequential, bounded-parallel, and
//!   paginated HTTP execution
//! - The event emitter contract shared with the execution engine

pub mod auth;
pub mod context;
pub mod error;
pub mod event;
pub mod iter;
pub mod registry;
pub mod result;
pub mod sink;
pub mod sql;
pub mod template;
pub mod tools;

pub use context::ExecutionContext;
pub use error::ToolError;
pub use event::{EventDraft, EventEmitter, EventStatus, EventType, MemoryEmitter};
pub use registry::{Tool, ToolConfig, ToolRegistry};
pub use result::{ToolResult, ToolStatus};
pub use template::TemplateEngine;
