//! External collaborator seams: the planning oracle and the worker body.
//!
//! The core never knows how plans are produced or what running a task
//! actually does; both are capabilities passed in behind traits. The
//! built-in implementations here are the simulation path used when no real
//! planner/executor service is wired up.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::model::{Plan, ResultStatus, RunContext, Task, TaskResult};

/// The planning oracle: turns free-form requirements into a task DAG.
///
/// The scheduler accepts whatever task count the planner chooses (it may
/// exceed the executor budget) and validates the returned plan itself.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, requirements: &str, max_executors: usize) -> Result<(usize, Plan)>;
}

/// Per-task execution context handed to the worker body.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Run this task belongs to.
    pub run: RunContext,
    /// 1-based id of the worker executing the task.
    pub worker_id: usize,
    /// Directory the worker body should write artifacts under.
    pub task_output_dir: PathBuf,
}

/// The worker body: executes one task attempt and returns a structured
/// result.
///
/// Implementations must not fail silently: a failed attempt is signalled
/// either by returning `Err` or by a result with `status == Failed`.
/// Treated as potentially blocking and I/O-heavy; callers never hold a
/// lock across this call.
#[async_trait]
pub trait WorkerBody: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> Result<TaskResult>;
}

// ---------------------------------------------------------------------------
// Simulation path
// ---------------------------------------------------------------------------

/// Worker body that simulates task execution.
///
/// Sleeps through a fixed number of progress steps, writes placeholder
/// artifacts under the task output directory, and reports synthetic
/// metrics. Used when no real executor service is configured.
#[derive(Debug, Clone)]
pub struct SimulatedWorker {
    /// Number of progress steps per task.
    pub steps: u32,
    /// Sleep per step.
    pub step_duration: Duration,
}

impl Default for SimulatedWorker {
    fn default() -> Self {
        Self {
            steps: 5,
            step_duration: Duration::from_secs(1),
        }
    }
}

impl SimulatedWorker {
    /// A fast variant for tests and dry runs.
    pub fn quick(step_duration: Duration) -> Self {
        Self {
            steps: 1,
            step_duration,
        }
    }
}

#[async_trait]
impl WorkerBody for SimulatedWorker {
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> Result<TaskResult> {
        let started = std::time::Instant::now();

        for step in 1..=self.steps {
            tokio::time::sleep(self.step_duration).await;
            tracing::debug!(
                task_id = %task.id,
                worker = ctx.worker_id,
                progress = %format!("{:.0}%", step as f64 / self.steps as f64 * 100.0),
                "simulated step"
            );
        }

        let output_files = ["implementation.py", "tests.py", "README.md"];
        tokio::fs::create_dir_all(&ctx.task_output_dir)
            .await
            .with_context(|| format!("failed to create {}", ctx.task_output_dir.display()))?;
        let mut written = Vec::with_capacity(output_files.len());
        for file in output_files {
            let path = ctx.task_output_dir.join(file);
            let body = format!(
                "# {}\n\n# Generated by executor-{}\n# Task ID: {}\n# Task: {}\n",
                task.name, ctx.worker_id, task.id, task.description
            );
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            written.push(path.to_string_lossy().into_owned());
        }

        Ok(TaskResult {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            worker: Some(format!("executor-{}", ctx.worker_id)),
            status: ResultStatus::Completed,
            execution_time_secs: started.elapsed().as_secs_f64(),
            output_files: written,
            metrics: Some(serde_json::json!({
                "lines_of_code": 150 + ctx.worker_id * 50,
                "test_coverage": 85 + ctx.worker_id * 2,
                "complexity_score": 3 + ctx.worker_id,
            })),
            error: None,
        })
    }
}

/// Deterministic stand-in for the planning service.
///
/// Produces a small scaffold / fan-out / integrate DAG so the orchestrator
/// can run end to end without the real planner. The task descriptions carry
/// the original requirements as context.
#[derive(Debug, Default, Clone)]
pub struct StandinPlanner;

#[async_trait]
impl Planner for StandinPlanner {
    async fn plan(&self, requirements: &str, max_executors: usize) -> Result<(usize, Plan)> {
        let fan_out = max_executors.clamp(2, 3);
        let mut tasks = vec![Task {
            id: "task_1".to_owned(),
            name: "Project scaffolding".to_owned(),
            description: format!("Set up the project structure for: {requirements}"),
            priority: 1,
            estimated_duration: Some("15min".to_owned()),
            payload: String::new(),
        }];

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let component_names = ["core logic", "data layer", "interface"];
        for (i, component) in component_names.iter().take(fan_out).enumerate() {
            let id = format!("task_{}", i + 2);
            tasks.push(Task {
                id: id.clone(),
                name: format!("Implement {component}"),
                description: format!("Implement the {component} for: {requirements}"),
                priority: 2,
                estimated_duration: Some("30min".to_owned()),
                payload: String::new(),
            });
            dependencies.insert(id, BTreeSet::from(["task_1".to_owned()]));
        }

        let final_id = format!("task_{}", fan_out + 2);
        tasks.push(Task {
            id: final_id.clone(),
            name: "Integration and docs".to_owned(),
            description: format!("Integrate the components and document: {requirements}"),
            priority: 3,
            estimated_duration: Some("20min".to_owned()),
            payload: String::new(),
        });
        dependencies.insert(
            final_id,
            (0..fan_out).map(|i| format!("task_{}", i + 2)).collect(),
        );

        let num_tasks = tasks.len();
        Ok((
            num_tasks,
            Plan {
                tasks,
                dependencies,
                executor_budget: max_executors,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;

    #[tokio::test]
    async fn standin_planner_produces_valid_dag() {
        let (num_tasks, plan_out) = StandinPlanner.plan("build a todo app", 4).await.unwrap();
        assert_eq!(num_tasks, plan_out.tasks.len());
        plan::validate(&plan_out).expect("stand-in plan should validate");
        // Scaffold first, integration last in topological order.
        let order = plan::topological_order(&plan_out);
        assert_eq!(order.first().unwrap().id, "task_1");
        assert_eq!(order.last().unwrap().id, format!("task_{num_tasks}"));
    }

    #[tokio::test]
    async fn simulated_worker_writes_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        let task = Task {
            id: "task_1".to_owned(),
            name: "Build thing".to_owned(),
            description: "make the thing".to_owned(),
            priority: 1,
            estimated_duration: None,
            payload: String::new(),
        };
        let ctx = WorkerContext {
            run: RunContext::new(dir.path().to_path_buf(), "req".to_owned(), false),
            worker_id: 2,
            task_output_dir: dir.path().join("executor_2").join("task_1"),
        };

        let worker = SimulatedWorker::quick(Duration::from_millis(1));
        let result = worker.execute(&task, &ctx).await.unwrap();

        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.output_files.len(), 3);
        assert!(ctx.task_output_dir.join("implementation.py").exists());
        assert!(result.execution_time_secs > 0.0);
        let metrics = result.metrics.unwrap();
        assert_eq!(metrics["lines_of_code"], 250);
    }
}
