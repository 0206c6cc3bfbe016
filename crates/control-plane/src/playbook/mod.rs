//! Playbook DSL: types, parsing, and validation.

mod parser;
mod types;

pub use parser::{parse_playbook, validate_playbook};
pub use types::{
    CallSpec, EndLoopSpec, NextClause, Playbook, Step, StepBody, TransitionTarget, WorkbookTask,
    END_STEP, START_STEP,
};
