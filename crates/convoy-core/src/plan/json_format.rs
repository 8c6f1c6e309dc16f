//! JSON wire format for planner output.
//!
//! The planning oracle emits a JSON document with the task list, the
//! dependency map, and the executor budget it planned against. These types
//! map directly to that schema and are deserialized via `serde` +
//! `serde_json`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Plan, Task};

use super::validate::{self, PlanError};

/// Top-level structure of a planner output document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanJson {
    /// Number of tasks the planner decided on. May exceed the executor
    /// budget; informational once `tasks` is present.
    #[serde(default)]
    pub num_tasks: Option<usize>,
    /// Tasks in planner order.
    #[serde(default)]
    pub tasks: Vec<TaskJson>,
    /// Map from task id to the ids it depends on.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Executor budget the plan was created for.
    #[serde(default)]
    pub max_executors: Option<usize>,
}

/// A single task entry in the planner document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskJson {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub payload: String,
}

fn default_priority() -> u8 {
    3
}

/// Errors that can occur while reading a planner document.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] PlanError),
}

/// Parse and validate a planner JSON document into a [`Plan`].
///
/// `default_budget` is used when the document does not carry
/// `max_executors`.
pub fn parse_plan_json(content: &str, default_budget: usize) -> Result<Plan, PlanParseError> {
    let doc: PlanJson = serde_json::from_str(content)?;
    let plan = plan_from_json(doc, default_budget);
    validate::validate(&plan)?;
    Ok(plan)
}

/// Convert the wire document into the in-memory plan without validating.
pub fn plan_from_json(doc: PlanJson, default_budget: usize) -> Plan {
    let tasks = doc
        .tasks
        .into_iter()
        .map(|t| Task {
            id: t.id,
            name: t.name,
            description: t.description,
            priority: t.priority,
            estimated_duration: t.estimated_duration,
            payload: t.payload,
        })
        .collect();

    let dependencies = doc
        .dependencies
        .into_iter()
        .map(|(id, deps)| (id, deps.into_iter().collect::<BTreeSet<_>>()))
        .collect();

    Plan {
        tasks,
        dependencies,
        executor_budget: doc.max_executors.unwrap_or(default_budget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_plan() {
        let json = r#"{
            "num_tasks": 2,
            "tasks": [
                {"id": "task_1", "name": "Schema", "description": "Design the schema", "priority": 1, "estimated_duration": "30min"},
                {"id": "task_2", "name": "API", "description": "Build the API", "priority": 2}
            ],
            "dependencies": {"task_2": ["task_1"]},
            "max_executors": 3
        }"#;
        let plan = parse_plan_json(json, 5).expect("should parse");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.executor_budget, 3);
        assert_eq!(plan.deps_of("task_2").collect::<Vec<_>>(), vec!["task_1"]);
        assert_eq!(plan.tasks[0].estimated_duration.as_deref(), Some("30min"));
    }

    #[test]
    fn missing_budget_falls_back_to_default() {
        let json = r#"{"tasks": [{"id": "t", "name": "T", "description": "d"}]}"#;
        let plan = parse_plan_json(json, 7).expect("should parse");
        assert_eq!(plan.executor_budget, 7);
        assert_eq!(plan.tasks[0].priority, 3, "priority should default");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_plan_json("not json {{{", 4).unwrap_err();
        assert!(matches!(err, PlanParseError::JsonError(_)), "got: {err}");
    }

    #[test]
    fn rejects_cyclic_document() {
        let json = r#"{
            "tasks": [
                {"id": "a", "name": "A", "description": "x"},
                {"id": "b", "name": "B", "description": "y"}
            ],
            "dependencies": {"a": ["b"], "b": ["a"]}
        }"#;
        let err = parse_plan_json(json, 4).unwrap_err();
        assert!(
            matches!(err, PlanParseError::Invalid(PlanError::CyclicDependency(_))),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_empty_document() {
        let err = parse_plan_json(r#"{"tasks": []}"#, 4).unwrap_err();
        assert!(
            matches!(err, PlanParseError::Invalid(PlanError::NoTasks)),
            "got: {err}"
        );
    }

    #[test]
    fn duplicate_dependency_entries_collapse() {
        let json = r#"{
            "tasks": [
                {"id": "a", "name": "A", "description": "x"},
                {"id": "b", "name": "B", "description": "y"}
            ],
            "dependencies": {"b": ["a", "a"]}
        }"#;
        let plan = parse_plan_json(json, 4).expect("should parse");
        assert_eq!(plan.deps_of("b").count(), 1);
    }
}
