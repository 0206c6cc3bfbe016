//! Transition evaluation.
//!
//! Given a step's `next` clauses and the live context, evaluation walks the
//! clauses in order and collects every matching target as
//! `(to_step, with_params, condition)`. The engine takes the first match;
//! the full ordered list is returned so a selector hook can choose
//! differently. Evaluation is deterministic for a fixed context.

use noetl_tools::TemplateEngine;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::AppResult;
use crate::playbook::{NextClause, Step, TransitionTarget};

/// One candidate transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to_step: String,

    /// Rendered parameters for the target step.
    pub with_params: Option<Value>,

    /// The condition that selected this target, when conditional.
    pub condition: Option<String>,
}

/// Evaluates `next` clauses against the live context.
pub struct TransitionEvaluator {
    template: TemplateEngine,
}

impl Default for TransitionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionEvaluator {
    pub fn new() -> Self {
        Self {
            template: TemplateEngine::new(),
        }
    }

    /// Evaluate a step's clauses, returning matches in clause order.
    pub fn evaluate(
        &self,
        step: &Step,
        context: &HashMap<String, Value>,
    ) -> AppResult<Vec<Transition>> {
        let mut matches = Vec::new();

        for clause in &step.next {
            match clause {
                NextClause::Target(target) => {
                    matches.push(self.render_target(target, context, None)?);
                }
                NextClause::Conditional {
                    when,
                    then,
                    otherwise,
                } => {
                    let truthy = self.template.evaluate_condition(when, context)?;
                    let (targets, condition) = if truthy {
                        (then, when.clone())
                    } else {
                        (otherwise, format!("!({})", when))
                    };
                    for target in targets {
                        matches.push(self.render_target(target, context, Some(condition.clone()))?);
                    }
                }
            }
        }

        Ok(matches)
    }

    fn render_target(
        &self,
        target: &TransitionTarget,
        context: &HashMap<String, Value>,
        condition: Option<String>,
    ) -> AppResult<Transition> {
        let with_params = match target.with() {
            Some(params) => Some(self.template.render_value(params, context)?),
            None => None,
        };
        Ok(Transition {
            to_step: target.step().to_string(),
            with_params,
            condition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_step(next_yaml: &str) -> Step {
        let yaml = format!("step: current\nnext:\n{}", next_yaml);
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn context_with(key: &str, value: Value) -> HashMap<String, Value> {
        let mut ctx = HashMap::new();
        ctx.insert(key.to_string(), value);
        ctx
    }

    #[test]
    fn test_plain_target_always_matches() {
        let step = make_step("  - next_step");
        let evaluator = TransitionEvaluator::new();

        let matches = evaluator.evaluate(&step, &HashMap::new()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].to_step, "next_step");
        assert!(matches[0].condition.is_none());
    }

    #[test]
    fn test_conditional_then_branch() {
        let step = make_step(
            r#"  - when: "{{ count > 3 }}"
    then: [high]
    else: [low]"#,
        );
        let evaluator = TransitionEvaluator::new();

        let matches = evaluator
            .evaluate(&step, &context_with("count", serde_json::json!(5)))
            .unwrap();
        assert_eq!(matches[0].to_step, "high");
        assert!(matches[0].condition.as_deref().unwrap().contains("count"));

        let matches = evaluator
            .evaluate(&step, &context_with("count", serde_json::json!(1)))
            .unwrap();
        assert_eq!(matches[0].to_step, "low");
        assert!(matches[0].condition.as_deref().unwrap().starts_with("!("));
    }

    #[test]
    fn test_with_params_rendered() {
        let step = make_step(
            r#"  - step: save
    with:
      value: "{{ temp }}""#,
        );
        let evaluator = TransitionEvaluator::new();

        let matches = evaluator
            .evaluate(&step, &context_with("temp", serde_json::json!(30)))
            .unwrap();
        assert_eq!(
            matches[0].with_params,
            Some(serde_json::json!({"value": 30}))
        );
    }

    #[test]
    fn test_deterministic_ordering() {
        let step = make_step(
            r#"  - when: "{{ flag }}"
    then: [a]
  - b
  - c"#,
        );
        let evaluator = TransitionEvaluator::new();
        let ctx = context_with("flag", serde_json::json!(true));

        let first = evaluator.evaluate(&step, &ctx).unwrap();
        let second = evaluator.evaluate(&step, &ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|t| t.to_step.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_no_clauses_is_empty() {
        let step: Step = serde_yaml::from_str("step: terminal").unwrap();
        let evaluator = TransitionEvaluator::new();
        assert!(evaluator.evaluate(&step, &HashMap::new()).unwrap().is_empty());
    }
}
