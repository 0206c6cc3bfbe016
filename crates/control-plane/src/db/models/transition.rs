//! Transition records for offline control-flow analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One taken `from_step -> to_step` edge.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub execution_id: i64,

    pub from_step: String,

    pub to_step: String,

    /// The `when` expression that matched, or null for unconditional edges.
    pub condition: Option<String>,

    /// Parameters passed to the target step.
    pub with_params: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn new(
        execution_id: i64,
        from_step: impl Into<String>,
        to_step: impl Into<String>,
        condition: Option<String>,
        with_params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            execution_id,
            from_step: from_step.into(),
            to_step: to_step.into(),
            condition,
            with_params,
            created_at: Utc::now(),
        }
    }
}
