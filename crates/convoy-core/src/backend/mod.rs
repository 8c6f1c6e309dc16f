//! The execution backend contract.
//!
//! Every concrete backend implements [`ExecutionBackend`]; the scheduler
//! depends on nothing else. The trait is object-safe so backends can be
//! carried as `Arc<dyn ExecutionBackend>` across the scheduler and worker
//! tasks.

pub mod batch;
pub mod cluster;
pub mod container;
pub mod threading;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Plan, RunContext, Task, TaskResult, TaskStatus};

/// Which concrete execution strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process worker pool over shared tables (the default).
    Threading,
    /// Local HPC cluster scheduler with file-based state.
    Cluster,
    /// Managed cluster on a cloud provider (cluster + object-store sync).
    CloudCluster,
    /// Managed cloud batch service with object-store state.
    CloudBatch,
    /// Local containers driven by the in-process scheduler.
    Containers,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Threading => "threading",
            Self::Cluster => "cluster",
            Self::CloudCluster => "cloud-cluster",
            Self::CloudBatch => "cloud-batch",
            Self::Containers => "containers",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = BackendKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threading" => Ok(Self::Threading),
            "cluster" => Ok(Self::Cluster),
            "cloud-cluster" => Ok(Self::CloudCluster),
            "cloud-batch" => Ok(Self::CloudBatch),
            "containers" => Ok(Self::Containers),
            other => Err(BackendKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackendKind`] string.
#[derive(Debug, Clone)]
pub struct BackendKindParseError(pub String);

impl fmt::Display for BackendKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backend kind: {:?}", self.0)
    }
}

impl std::error::Error for BackendKindParseError {}

/// Uniform contract every execution backend implements.
///
/// Lifecycle: `initialize` -> `submit_tasks` -> `wait_for_completion` ->
/// `get_results` -> `cleanup`. The mark/query methods are used by worker
/// bodies and monitoring code during the wait.
///
/// # Object Safety
///
/// This trait is object-safe; the scheduler holds backends as
/// `Arc<dyn ExecutionBackend>`.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short backend identifier (e.g. "threading", "cloud-batch").
    fn name(&self) -> &str;

    /// Create durable state and validate external resources.
    ///
    /// Fails fast with a descriptive error when an external service is
    /// unreachable; nothing has been submitted at that point.
    async fn initialize(&self) -> Result<()>;

    /// Commit the plan to backend-specific storage. Idempotent per run id.
    async fn submit_tasks(&self, plan: &Plan, ctx: &RunContext) -> Result<()>;

    /// Block until every task is terminal, honoring the dependency graph
    /// and the executor budget.
    async fn wait_for_completion(&self, max_executors: usize) -> Result<()>;

    /// Current status snapshot for one task. Eventually consistent for
    /// durable backends.
    async fn get_task_status(&self, task_id: &str) -> TaskStatus;

    /// All terminal results known so far.
    async fn get_results(&self) -> Vec<TaskResult>;

    /// Record a completed attempt. Called by the worker body; the result
    /// must be durably recorded before the completion is observable.
    async fn mark_task_complete(&self, task_id: &str, result: TaskResult) -> Result<()>;

    /// Record a failed attempt. Enters the retry path; the task only
    /// becomes terminal once the retry budget is exhausted.
    async fn mark_task_failed(&self, task_id: &str, error: &str) -> Result<()>;

    /// Whether all of the task's dependencies are completed.
    async fn can_execute_task(&self, task: &Task) -> bool;

    /// Snapshot of completed task ids.
    async fn get_completed_tasks(&self) -> BTreeSet<String>;

    /// Snapshot of in-progress task ids.
    async fn get_in_progress_tasks(&self) -> BTreeSet<String>;

    /// Flush durable state and release remote resources.
    async fn cleanup(&self) -> Result<()>;

    /// Key/value description of the backend for logging.
    fn backend_info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("backend".to_owned(), self.name().to_owned())])
    }
}

// Compile-time assertion: the contract must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ExecutionBackend) {}
};

impl fmt::Debug for dyn ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionBackend")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_display_roundtrip() {
        let variants = [
            BackendKind::Threading,
            BackendKind::Cluster,
            BackendKind::CloudCluster,
            BackendKind::CloudBatch,
            BackendKind::Containers,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BackendKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn backend_kind_invalid() {
        assert!("hyperdrive".parse::<BackendKind>().is_err());
    }
}
