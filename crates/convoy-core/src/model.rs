use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Observable status of a task.
///
/// `Failed` covers both a retryable failure (the task will be reset to
/// `Pending` when the retry budget allows) and a terminal one (retries
/// exhausted). `Unknown` is returned for ids the backend has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Unknown,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "unknown" => Ok(Self::Unknown),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Outcome recorded in a [`TaskResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ResultStatus {
    type Err = ResultStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ResultStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ResultStatus`] string.
#[derive(Debug, Clone)]
pub struct ResultStatusParseError(pub String);

impl fmt::Display for ResultStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid result status: {:?}", self.0)
    }
}

impl std::error::Error for ResultStatusParseError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A unit of work with a stable id and an opaque payload.
///
/// Immutable once the plan is constructed. Equality and hashing are by `id`;
/// the id is stable across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique short identifier (e.g. "task_3"), stable across retries.
    pub id: String,
    /// Human-readable task name.
    pub name: String,
    /// What the worker body should accomplish.
    pub description: String,
    /// 1 = highest priority, 5 = lowest. Tie-break only; not preemption.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Informational duration estimate from the planner (e.g. "30min").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    /// Opaque payload handed verbatim to the worker body.
    #[serde(default)]
    pub payload: String,
}

fn default_priority() -> u8 {
    3
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// The full, immutable DAG of tasks produced by the planner for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Tasks in insertion order. Order is preserved for tie-breaking.
    pub tasks: Vec<Task>,
    /// Map from task id to the ids that must complete before it may start.
    /// A task absent from the map has no dependencies.
    #[serde(default)]
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Maximum concurrent workers the scheduler may present to the backend.
    pub executor_budget: usize,
}

impl Plan {
    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Dependencies of a task. Missing entries mean "no dependencies".
    pub fn deps_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Number of tasks in the plan.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the plan contains no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Structured result produced by a worker body for one terminal attempt.
///
/// Produced at most once per attempt; on retry, the newer result replaces
/// the older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default)]
    pub task_name: String,
    /// Name of the worker that produced the result (e.g. "executor-2").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub status: ResultStatus,
    /// Wall time of the attempt, in seconds.
    #[serde(default)]
    pub execution_time_secs: f64,
    /// Artifacts written under the task output directory.
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Free-form metrics reported by the worker body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    /// Failure description; present iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// Build a failure result with only the error populated.
    pub fn failure(task_id: &str, task_name: &str, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_owned(),
            task_name: task_name.to_owned(),
            worker: None,
            status: ResultStatus::Failed,
            execution_time_secs: 0.0,
            output_files: Vec::new(),
            metrics: None,
            error: Some(error.into()),
        }
    }
}

/// Per-invocation context: one orchestration run over one plan.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique run identifier: timestamp plus a random suffix.
    pub run_id: String,
    /// Root directory for all artifacts of this run.
    pub output_dir: PathBuf,
    /// Original free-form requirements (opaque to the core).
    pub requirements: String,
    /// Whether worker bodies should do real work or simulate it.
    pub use_real_executors: bool,
}

impl RunContext {
    /// Create a run context with a freshly generated run id.
    pub fn new(output_dir: PathBuf, requirements: String, use_real_executors: bool) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let run_id = format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8]);
        Self {
            run_id,
            output_dir,
            requirements,
            use_real_executors,
        }
    }
}

/// Aggregated outcome of one run, emitted after all tasks are terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub backend: String,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    /// Dependents of terminally failed tasks that were never claimed.
    pub skipped: Vec<String>,
    /// True iff every task completed.
    pub success: bool,
    /// Percentage of tasks completed, formatted as "92.3%".
    pub success_rate: String,
    pub total_files_created: usize,
    pub total_execution_secs: f64,
    pub results: Vec<TaskResult>,
}

impl RunSummary {
    /// Aggregate a result set into a summary.
    pub fn from_results(
        run_id: &str,
        backend: &str,
        total_tasks: usize,
        skipped: Vec<String>,
        results: Vec<TaskResult>,
        total_execution_secs: f64,
    ) -> Self {
        let completed = results
            .iter()
            .filter(|r| r.status == ResultStatus::Completed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == ResultStatus::Failed)
            .count();
        let total_files_created = results
            .iter()
            .filter(|r| r.status == ResultStatus::Completed)
            .map(|r| r.output_files.len())
            .sum();
        let rate = completed as f64 / total_tasks.max(1) as f64 * 100.0;

        Self {
            run_id: run_id.to_owned(),
            backend: backend.to_owned(),
            total_tasks,
            completed,
            failed,
            skipped,
            success: completed == total_tasks,
            success_rate: format!("{rate:.1}%"),
            total_files_created,
            total_execution_secs,
            results,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Unknown,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Unknown.is_terminal());
    }

    #[test]
    fn result_status_display_roundtrip() {
        for v in &[ResultStatus::Completed, ResultStatus::Failed] {
            let s = v.to_string();
            let parsed: ResultStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_equality_is_by_id() {
        let a = Task {
            id: "task_1".to_owned(),
            name: "First".to_owned(),
            description: "one thing".to_owned(),
            priority: 1,
            estimated_duration: None,
            payload: String::new(),
        };
        let mut b = a.clone();
        b.name = "Renamed".to_owned();
        b.priority = 5;
        assert_eq!(a, b, "tasks with the same id should be equal");
    }

    #[test]
    fn run_id_has_timestamp_and_suffix() {
        let ctx = RunContext::new(PathBuf::from("/tmp/out"), "build it".to_owned(), false);
        // "20250101_120000_ab12cd34" -> 24 chars, two underscores.
        assert_eq!(ctx.run_id.len(), 24, "unexpected run id: {}", ctx.run_id);
        assert_eq!(ctx.run_id.matches('_').count(), 2);
    }

    #[test]
    fn run_ids_are_unique() {
        let a = RunContext::new(PathBuf::from("."), String::new(), false);
        let b = RunContext::new(PathBuf::from("."), String::new(), false);
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn task_result_serde_roundtrip_is_bytewise() {
        let result = TaskResult {
            task_id: "task_1".to_owned(),
            task_name: "Build API".to_owned(),
            worker: Some("executor-1".to_owned()),
            status: ResultStatus::Completed,
            execution_time_secs: 12.34,
            output_files: vec!["src/api.py".to_owned()],
            metrics: Some(serde_json::json!({"lines_of_code": 200})),
            error: None,
        };
        let bytes = serde_json::to_vec(&result).unwrap();
        let back: TaskResult = serde_json::from_slice(&bytes).unwrap();
        let bytes2 = serde_json::to_vec(&back).unwrap();
        assert_eq!(bytes, bytes2);
        assert_eq!(result, back);
    }

    #[test]
    fn summary_aggregates_counts_and_rate() {
        let results = vec![
            TaskResult {
                task_id: "a".to_owned(),
                task_name: "A".to_owned(),
                worker: None,
                status: ResultStatus::Completed,
                execution_time_secs: 1.0,
                output_files: vec!["x".to_owned(), "y".to_owned()],
                metrics: None,
                error: None,
            },
            TaskResult::failure("b", "B", "boom"),
        ];
        let summary = RunSummary::from_results("run", "threading", 3, vec!["c".to_owned()], results, 5.0);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, vec!["c".to_owned()]);
        assert!(!summary.success);
        assert_eq!(summary.success_rate, "33.3%");
        assert_eq!(summary.total_files_created, 2);
    }

    #[test]
    fn summary_success_iff_all_completed() {
        let results = vec![TaskResult {
            task_id: "a".to_owned(),
            task_name: "A".to_owned(),
            worker: None,
            status: ResultStatus::Completed,
            execution_time_secs: 0.5,
            output_files: vec![],
            metrics: None,
            error: None,
        }];
        let summary = RunSummary::from_results("run", "threading", 1, vec![], results, 1.0);
        assert!(summary.success);
        assert_eq!(summary.success_rate, "100.0%");
    }
}
