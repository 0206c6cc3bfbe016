//! Playbook parsing and validation.
//!
//! Validation runs at load time: a `start` step must exist, step names must
//! be unique, every transition target and `call` reference must resolve, and
//! every `end_loop` must name a loop step. Failures surface as 4xx errors to
//! the caller.

use std::collections::HashSet;

use crate::error::{AppError, AppResult};
use crate::playbook::types::{NextClause, Playbook, StepBody, END_STEP, START_STEP};

/// Parse YAML content into a validated playbook.
pub fn parse_playbook(content: &str) -> AppResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(content)
        .map_err(|e| AppError::Parse(format!("Invalid playbook YAML: {}", e)))?;
    validate_playbook(&playbook)?;
    Ok(playbook)
}

/// Validate cross-references within a playbook.
pub fn validate_playbook(playbook: &Playbook) -> AppResult<()> {
    if playbook.workflow.is_empty() {
        return Err(AppError::Validation("Playbook has no workflow steps".to_string()));
    }

    if playbook.get_step(START_STEP).is_none() {
        return Err(AppError::Validation(format!(
            "Playbook '{}' has no '{}' step",
            playbook.name, START_STEP
        )));
    }

    let mut seen = HashSet::new();
    for step in &playbook.workflow {
        if !seen.insert(step.step.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate step name: '{}'",
                step.step
            )));
        }
    }

    let known: HashSet<&str> = playbook
        .workflow
        .iter()
        .map(|s| s.step.as_str())
        .chain(std::iter::once(END_STEP))
        .collect();

    for step in &playbook.workflow {
        for clause in &step.next {
            for target in clause_targets(clause) {
                if !known.contains(target) {
                    return Err(AppError::Validation(format!(
                        "Step '{}' transitions to unknown step '{}'",
                        step.step, target
                    )));
                }
            }
        }

        match step.body() {
            StepBody::Call(call) => {
                if playbook.get_task(&call.name).is_none() {
                    return Err(AppError::Validation(format!(
                        "Step '{}' calls unknown task '{}'",
                        step.step, call.name
                    )));
                }
            }
            StepBody::EndLoop(spec) => {
                let loop_name = spec.loop_name();
                let is_loop = playbook
                    .get_step(loop_name)
                    .map(|s| s.loop_spec.is_some())
                    .unwrap_or(false);
                if !is_loop {
                    return Err(AppError::Validation(format!(
                        "Step '{}' closes '{}', which is not a loop step",
                        step.step, loop_name
                    )));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn clause_targets(clause: &NextClause) -> Vec<&str> {
    match clause {
        NextClause::Target(target) => vec![target.step()],
        NextClause::Conditional { then, otherwise, .. } => then
            .iter()
            .chain(otherwise.iter())
            .map(|t| t.step())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name: demo
workflow:
  - step: start
    next: [fetch]
  - step: fetch
    call:
      name: get_data
    next:
      - when: "{{ fetch.status == 'success' }}"
        then: [end]
        else: [retry]
  - step: retry
    next: [end]
workbook:
  - name: get_data
    tool: http
    endpoint: "http://api.local/data"
"#;

    #[test]
    fn test_parse_valid() {
        let playbook = parse_playbook(VALID).unwrap();
        assert_eq!(playbook.name, "demo");
    }

    #[test]
    fn test_missing_start_rejected() {
        let yaml = r#"
name: bad
workflow:
  - step: only
"#;
        let result = parse_playbook(yaml);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let yaml = r#"
name: bad
workflow:
  - step: start
  - step: start
"#;
        let result = parse_playbook(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_next_target_rejected() {
        let yaml = r#"
name: bad
workflow:
  - step: start
    next: [nowhere]
"#;
        let result = parse_playbook(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_call_target_rejected() {
        let yaml = r#"
name: bad
workflow:
  - step: start
    call:
      name: missing_task
"#;
        let result = parse_playbook(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_end_is_implicitly_known() {
        let yaml = r#"
name: ok
workflow:
  - step: start
    next: [end]
"#;
        assert!(parse_playbook(yaml).is_ok());
    }

    #[test]
    fn test_end_loop_must_close_a_loop() {
        let yaml = r#"
name: bad
workflow:
  - step: start
    next: [closer]
  - step: closer
    end_loop: start
"#;
        let result = parse_playbook(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let result = parse_playbook("workflow: [');");
        assert!(matches!(result, Err(AppError::Parse(_))));
    }
}
