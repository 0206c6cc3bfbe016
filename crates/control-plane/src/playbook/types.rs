//! Playbook document types.
//!
//! A playbook is a YAML document with a `workflow` (ordered step graph) and
//! a `workbook` (library of reusable tasks). Step names `start` and `end`
//! are reserved terminals.

use serde::{Deserialize, Serialize};

/// The reserved initial step name.
pub const START_STEP: &str = "start";

/// The reserved terminal step name.
pub const END_STEP: &str = "end";

/// Complete playbook document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (noetl.io/v1).
    #[serde(rename = "apiVersion", default)]
    pub api_version: Option<String>,

    /// Resource kind (Playbook).
    #[serde(default)]
    pub kind: Option<String>,

    /// Playbook name.
    pub name: String,

    /// Catalog resource path.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial context seeded into every execution.
    #[serde(default)]
    pub workload: Option<serde_json::Value>,

    /// Ordered step graph.
    pub workflow: Vec<Step>,

    /// Library of reusable tasks.
    #[serde(default)]
    pub workbook: Vec<WorkbookTask>,
}

impl Playbook {
    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Get a workbook task by name.
    pub fn get_task(&self, name: &str) -> Option<&WorkbookTask> {
        self.workbook.iter().find(|t| t.name == name)
    }

    /// All step names in workflow order.
    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }

    /// Find the `end_loop` step that closes the given loop step, if any.
    pub fn end_loop_for(&self, loop_step: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| {
            s.end_loop
                .as_ref()
                .is_some_and(|spec| spec.loop_name() == loop_step)
        })
    }
}

/// One workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique; `start` and `end` are reserved).
    pub step: String,

    #[serde(default)]
    pub desc: Option<String>,

    /// Iterate a collection with a nested task.
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<serde_json::Value>,

    /// Close a loop and bind its aggregated results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_loop: Option<EndLoopSpec>,

    /// Invoke a workbook task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSpec>,

    /// Transition clauses.
    #[serde(default)]
    pub next: Vec<NextClause>,

    /// Parameters bound on entry.
    #[serde(default)]
    pub with: Option<serde_json::Value>,
}

impl Step {
    /// The body selector of this step; a step carries at most one.
    pub fn body(&self) -> StepBody<'_> {
        if let Some(ref spec) = self.loop_spec {
            StepBody::Loop(spec)
        } else if let Some(ref spec) = self.end_loop {
            StepBody::EndLoop(spec)
        } else if let Some(ref call) = self.call {
            StepBody::Call(call)
        } else {
            StepBody::Terminal
        }
    }
}

/// Borrowed view of a step's body.
#[derive(Debug, Clone, Copy)]
pub enum StepBody<'a> {
    Loop(&'a serde_json::Value),
    EndLoop(&'a EndLoopSpec),
    Call(&'a CallSpec),
    Terminal,
}

/// `end_loop` body: either just the loop step name or a full spec with
/// result templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndLoopSpec {
    Full {
        /// Name of the loop step being closed.
        #[serde(rename = "loop")]
        loop_name: String,

        /// Templates computed against the context with results bound.
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Name(String),
}

impl EndLoopSpec {
    pub fn loop_name(&self) -> &str {
        match self {
            EndLoopSpec::Name(name) => name,
            EndLoopSpec::Full { loop_name, .. } => loop_name,
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            EndLoopSpec::Name(_) => None,
            EndLoopSpec::Full { result, .. } => result.as_ref(),
        }
    }
}

/// `call` body: the workbook task to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    /// Task name in the workbook.
    #[serde(alias = "task")]
    pub name: String,

    /// Parameters rendered and passed to the task.
    #[serde(default)]
    pub with: Option<serde_json::Value>,
}

/// One transition clause in a step's `next` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextClause {
    /// Conditional routing with optional else branch.
    Conditional {
        when: String,
        then: Vec<TransitionTarget>,
        #[serde(default, rename = "else")]
        otherwise: Vec<TransitionTarget>,
    },

    /// A target with optional parameters.
    Target(TransitionTarget),
}

/// A transition target: plain step name or `{step, with}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionTarget {
    Object {
        step: String,
        #[serde(default)]
        with: Option<serde_json::Value>,
    },
    Name(String),
}

impl TransitionTarget {
    pub fn step(&self) -> &str {
        match self {
            TransitionTarget::Name(name) => name,
            TransitionTarget::Object { step, .. } => step,
        }
    }

    pub fn with(&self) -> Option<&serde_json::Value> {
        match self {
            TransitionTarget::Name(_) => None,
            TransitionTarget::Object { with, .. } => with.as_ref(),
        }
    }
}

/// Reusable task definition in the workbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookTask {
    /// Task name.
    pub name: String,

    /// Tool identifier (http, postgres, duckdb, python, iterator, transfer).
    #[serde(alias = "type")]
    pub tool: String,

    /// Tool-specific fields plus optional auth/sink/return/with.
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl WorkbookTask {
    /// The full task body as a JSON value (tool + config fields).
    pub fn to_task_value(&self) -> serde_json::Value {
        let mut map = self.config.clone();
        map.insert(
            "tool".to_string(),
            serde_json::Value::String(self.tool.clone()),
        );
        map.insert(
            "name".to_string(),
            serde_json::Value::String(self.name.clone()),
        );
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
name: weather
path: examples/weather
workload:
  city: Bergen
workflow:
  - step: start
    next:
      - step: fetch
  - step: fetch
    call:
      name: get_weather
      with:
        q: "{{ city }}"
    next:
      - step: end
  - step: end
workbook:
  - name: get_weather
    tool: http
    endpoint: "http://api.local/forecast?q={{ q }}"
    method: GET
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.name, "weather");
        assert_eq!(playbook.workflow.len(), 3);

        let fetch = playbook.get_step("fetch").unwrap();
        match fetch.body() {
            StepBody::Call(call) => {
                assert_eq!(call.name, "get_weather");
                assert!(call.with.is_some());
            }
            other => panic!("expected call body, got {:?}", other),
        }

        let end = playbook.get_step("end").unwrap();
        assert!(matches!(end.body(), StepBody::Terminal));

        let task = playbook.get_task("get_weather").unwrap();
        assert_eq!(task.tool, "http");
        assert!(task.config.contains_key("endpoint"));
    }

    #[test]
    fn test_parse_conditional_next() {
        let yaml = r#"
name: branching
workflow:
  - step: start
    next:
      - when: "{{ result.ok }}"
        then:
          - step: good
        else:
          - step: bad
      - fallback
  - step: good
  - step: bad
  - step: fallback
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let start = playbook.get_step("start").unwrap();
        assert_eq!(start.next.len(), 2);
        match &start.next[0] {
            NextClause::Conditional { when, then, otherwise } => {
                assert!(when.contains("result.ok"));
                assert_eq!(then[0].step(), "good");
                assert_eq!(otherwise[0].step(), "bad");
            }
            other => panic!("expected conditional, got {:?}", other),
        }
        match &start.next[1] {
            NextClause::Target(target) => assert_eq!(target.step(), "fallback"),
            other => panic!("expected target, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_loop_and_end_loop() {
        let yaml = r#"
name: loops
workflow:
  - step: start
    next: [fan_out]
  - step: fan_out
    loop:
      collection: "{{ items }}"
      element: item
      task:
        tool: python
        code: "fn main(input_data) { input_data.item }"
    next: [collect]
  - step: collect
    end_loop:
      loop: fan_out
      result:
        total: "{{ fan_out_results | length }}"
    next: [end]
  - step: end
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();

        let fan_out = playbook.get_step("fan_out").unwrap();
        assert!(matches!(fan_out.body(), StepBody::Loop(_)));

        let collect = playbook.get_step("collect").unwrap();
        match collect.body() {
            StepBody::EndLoop(spec) => {
                assert_eq!(spec.loop_name(), "fan_out");
                assert!(spec.result().is_some());
            }
            other => panic!("expected end_loop, got {:?}", other),
        }

        assert_eq!(
            playbook.end_loop_for("fan_out").map(|s| s.step.as_str()),
            Some("collect")
        );
    }

    #[test]
    fn test_end_loop_shorthand() {
        let yaml = r#"
name: shorthand
workflow:
  - step: close
    end_loop: fan_out
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        match playbook.workflow[0].body() {
            StepBody::EndLoop(spec) => assert_eq!(spec.loop_name(), "fan_out"),
            other => panic!("expected end_loop, got {:?}", other),
        }
    }

    #[test]
    fn test_workbook_task_to_value() {
        let yaml = r#"
name: persist
tool: postgres
auth: pg_local
command: "INSERT INTO t(v) VALUES (1);"
"#;
        let task: WorkbookTask = serde_yaml::from_str(yaml).unwrap();
        let value = task.to_task_value();
        assert_eq!(value["tool"], serde_json::json!("postgres"));
        assert_eq!(value["auth"], serde_json::json!("pg_local"));
    }
}
