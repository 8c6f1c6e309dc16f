//! Local container execution backend.
//!
//! A hybrid: planning and dependency enforcement stay in-process, but each
//! task attempt runs inside a container launched by the orchestrator. Tasks
//! are round-robin assigned to a fixed pool of container workers at
//! submission time; each worker drives its list in order, waiting until a
//! task's dependencies are completed before its container is started. This
//! trades DAG-level parallelism for isolation, which is acceptable because
//! container startup latency dominates the scheduling gain for typical
//! pool sizes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;

use crate::error::OrchestratorError;
use crate::jobs::container::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::model::{Plan, ResultStatus, RunContext, Task, TaskResult, TaskStatus};
use crate::plan::DependentsIndex;
use crate::retry::{RetryManager, RetryPolicy};
use crate::state::TaskDefinition;

use super::ExecutionBackend;

/// Tuning knobs for the container backend.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub network: Option<String>,
    /// Command run inside each task container; empty uses the image default.
    pub command: Vec<String>,
    /// Sleep between container status checks.
    pub poll_interval: Duration,
    /// Sleep between dependency rechecks while a task waits its turn.
    pub dependency_recheck: Duration,
    pub retry: RetryPolicy,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "convoy-worker:latest".to_owned(),
            network: None,
            command: Vec::new(),
            poll_interval: Duration::from_secs(5),
            dependency_recheck: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct ContainerRun {
    plan: Option<Arc<Plan>>,
    ctx: Option<RunContext>,
    dependents: Option<DependentsIndex>,
    /// Round-robin task assignment, one list per worker.
    assignments: Vec<Vec<String>>,
    completed: BTreeSet<String>,
    in_progress: BTreeSet<String>,
    terminal_failed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    results: BTreeMap<String, TaskResult>,
    /// Containers launched during the run, for cleanup.
    containers: Vec<String>,
}

impl ContainerRun {
    fn record_result(&mut self, result: TaskResult) {
        self.results.insert(result.task_id.clone(), result);
    }

    fn propagate_skip(&mut self, failed_id: &str) {
        let Some(dependents) = &self.dependents else {
            return;
        };
        for dep_id in dependents.transitive_dependents(failed_id) {
            if !self.completed.contains(&dep_id) && !self.terminal_failed.contains(&dep_id) {
                self.skipped.insert(dep_id);
            }
        }
    }
}

/// Whether a waiting task can start, must be skipped, or should keep
/// waiting.
enum Gate {
    Ready,
    Doomed,
    Wait,
}

/// The container backend.
pub struct ContainerBackend {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    run: Mutex<ContainerRun>,
    retry: Mutex<RetryManager>,
}

impl ContainerBackend {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        let retry = RetryManager::new(config.retry.clone());
        Self {
            runtime,
            config,
            run: Mutex::new(ContainerRun::default()),
            retry: Mutex::new(retry),
        }
    }

    pub fn skipped_tasks(&self) -> Vec<String> {
        let run = self.run.lock().expect("run lock poisoned");
        run.skipped.iter().cloned().collect()
    }

    fn gate(&self, task_id: &str) -> Gate {
        let run = self.run.lock().expect("run lock poisoned");
        if run.skipped.contains(task_id) {
            return Gate::Doomed;
        }
        let Some(plan) = &run.plan else {
            return Gate::Wait;
        };
        let mut ready = true;
        for dep in plan.deps_of(task_id) {
            if run.terminal_failed.contains(dep) || run.skipped.contains(dep) {
                return Gate::Doomed;
            }
            if !run.completed.contains(dep) {
                ready = false;
            }
        }
        if ready { Gate::Ready } else { Gate::Wait }
    }

    /// Run one container attempt for a task. Returns the task result read
    /// from the mounted output directory, or an error description.
    async fn run_container_attempt(
        &self,
        task: &Task,
        worker_id: usize,
        attempt: u32,
    ) -> Result<TaskResult, String> {
        let (ctx, plan) = {
            let run = self.run.lock().expect("run lock poisoned");
            match (&run.ctx, &run.plan) {
                (Some(ctx), Some(plan)) => (ctx.clone(), Arc::clone(plan)),
                _ => return Err("tasks not submitted".to_owned()),
            }
        };

        let task_dir = ctx
            .output_dir
            .join(format!("executor_{worker_id}"))
            .join(&task.id);
        tokio::fs::create_dir_all(&task_dir)
            .await
            .map_err(|e| format!("failed to create task dir: {e}"))?;

        // The container reads its brief from the mounted directory.
        let def = TaskDefinition {
            task: task.clone(),
            requirements: ctx.requirements.clone(),
            use_real_executors: ctx.use_real_executors,
            output_dir: "/output".to_owned(),
            plan: plan.as_ref().clone(),
            run_id: ctx.run_id.clone(),
        };
        let def_json =
            serde_json::to_vec_pretty(&def).map_err(|e| format!("failed to encode task: {e}"))?;
        tokio::fs::write(task_dir.join("task.json"), def_json)
            .await
            .map_err(|e| format!("failed to write task file: {e}"))?;

        let spec = ContainerSpec {
            name: format!("convoy-{}-{}-a{attempt}", ctx.run_id, task.id),
            image: self.config.image.clone(),
            env: vec![
                ("CONVOY_TASK_ID".to_owned(), task.id.clone()),
                ("CONVOY_EXECUTOR_ID".to_owned(), worker_id.to_string()),
                ("CONVOY_OUTPUT_DIR".to_owned(), "/output".to_owned()),
                ("CONVOY_REQUIREMENTS".to_owned(), ctx.requirements.clone()),
                (
                    "CONVOY_USE_REAL_EXECUTORS".to_owned(),
                    ctx.use_real_executors.to_string(),
                ),
            ],
            volumes: vec![(task_dir.clone(), "/output".to_owned())],
            network: self.config.network.clone(),
            command: self.config.command.clone(),
        };

        let container_id = self
            .runtime
            .run(&spec)
            .await
            .map_err(|e| format!("failed to start container: {e:#}"))?;
        tracing::info!(
            task_id = %task.id,
            container = %container_id,
            worker = worker_id,
            "container started"
        );
        {
            let mut run = self.run.lock().expect("run lock poisoned");
            run.containers.push(container_id.clone());
        }

        // Poll the container until it leaves the running state.
        let exit_code = loop {
            match self.runtime.status(&container_id).await {
                Ok(ContainerState::Running) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(ContainerState::Exited(code)) => break code,
                Ok(ContainerState::Gone) => break 0,
                Err(e) => return Err(format!("failed to check container: {e:#}")),
            }
        };

        if exit_code != 0 {
            let logs = self
                .runtime
                .tail_logs(&container_id, 50)
                .await
                .unwrap_or_default();
            tracing::warn!(
                task_id = %task.id,
                exit_code,
                logs = %logs.trim(),
                "container exited nonzero"
            );
            return Err(format!("container exited with code {exit_code}"));
        }

        // A clean exit must leave a result artifact behind.
        let result_path = task_dir.join("result.json");
        let bytes = tokio::fs::read(&result_path)
            .await
            .map_err(|_| "missing result".to_owned())?;
        serde_json::from_slice(&bytes).map_err(|e| format!("unreadable result: {e}"))
    }

    /// Drive one worker's assigned task list to completion.
    async fn worker_driver(&self, worker_id: usize, task_ids: Vec<String>) {
        for task_id in task_ids {
            // Dependencies are enforced here, before the container is told
            // to begin the task.
            loop {
                match self.gate(&task_id) {
                    Gate::Ready => break,
                    Gate::Doomed => {
                        let mut run = self.run.lock().expect("run lock poisoned");
                        run.skipped.insert(task_id.clone());
                        tracing::info!(task_id = %task_id, "skipping task (failed ancestor)");
                        break;
                    }
                    Gate::Wait => {
                        tokio::time::sleep(self.config.dependency_recheck).await;
                    }
                }
            }
            {
                let run = self.run.lock().expect("run lock poisoned");
                if run.skipped.contains(&task_id) {
                    continue;
                }
            }

            let task = {
                let run = self.run.lock().expect("run lock poisoned");
                run.plan
                    .as_ref()
                    .and_then(|p| p.task(&task_id))
                    .cloned()
            };
            let Some(task) = task else {
                continue;
            };

            {
                let mut run = self.run.lock().expect("run lock poisoned");
                run.in_progress.insert(task_id.clone());
            }

            // Attempt loop: the worker owns the task through its retries.
            loop {
                let attempt = {
                    let retry = self.retry.lock().expect("retry lock poisoned");
                    retry.retry_count(&task_id)
                };
                match self.run_container_attempt(&task, worker_id, attempt).await {
                    Ok(result) if result.status == ResultStatus::Completed => {
                        let mut run = self.run.lock().expect("run lock poisoned");
                        run.record_result(result);
                        run.in_progress.remove(&task_id);
                        run.completed.insert(task_id.clone());
                        tracing::info!(task_id = %task_id, "task completed");
                        break;
                    }
                    Ok(result) => {
                        let error =
                            result.error.clone().unwrap_or_else(|| "failed".to_owned());
                        if !self.retry_or_terminal(&task, &error).await {
                            break;
                        }
                    }
                    Err(error) => {
                        if !self.retry_or_terminal(&task, &error).await {
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(worker = worker_id, "container worker finished");
    }

    /// Returns true when the attempt loop should try again.
    async fn retry_or_terminal(&self, task: &Task, error: &str) -> bool {
        let retry_delay = {
            let mut retry = self.retry.lock().expect("retry lock poisoned");
            if retry.should_retry(&task.id) {
                let delay = retry.delay_for(&task.id);
                let attempt = retry.record_attempt(&task.id);
                tracing::warn!(
                    task_id = %task.id,
                    attempt,
                    error,
                    "container attempt failed, will retry"
                );
                Some(delay)
            } else {
                None
            }
        };

        match retry_delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                tracing::error!(task_id = %task.id, error, "task failed terminally");
                let mut run = self.run.lock().expect("run lock poisoned");
                run.record_result(TaskResult::failure(&task.id, &task.name, error));
                run.in_progress.remove(&task.id);
                run.terminal_failed.insert(task.id.clone());
                run.propagate_skip(&task.id);
                false
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        "containers"
    }

    async fn initialize(&self) -> Result<()> {
        if !self
            .runtime
            .image_exists(&self.config.image)
            .await
            .unwrap_or(false)
        {
            return Err(OrchestratorError::BackendUnavailable {
                backend: "containers".to_owned(),
                reason: format!(
                    "container image {:?} not found; build it first",
                    self.config.image
                ),
            }
            .into());
        }
        if let Some(network) = &self.config.network {
            self.runtime
                .ensure_network(network)
                .await
                .with_context(|| format!("failed to prepare network {network:?}"))?;
        }
        tracing::info!(image = %self.config.image, "container backend initialized");
        Ok(())
    }

    async fn submit_tasks(&self, plan: &Plan, ctx: &RunContext) -> Result<()> {
        let num_workers = plan.executor_budget.max(1).min(plan.len().max(1));
        let mut assignments: Vec<Vec<String>> = vec![Vec::new(); num_workers];
        for (idx, task) in plan.tasks.iter().enumerate() {
            assignments[idx % num_workers].push(task.id.clone());
        }
        assignments.retain(|list| !list.is_empty());

        let mut run = self.run.lock().expect("run lock poisoned");
        run.dependents = Some(DependentsIndex::new(plan));
        run.plan = Some(Arc::new(plan.clone()));
        run.ctx = Some(ctx.clone());
        tracing::info!(
            tasks = plan.len(),
            workers = assignments.len(),
            "distributed tasks across container workers"
        );
        run.assignments = assignments;
        Ok(())
    }

    async fn wait_for_completion(&self, _max_executors: usize) -> Result<()> {
        let assignments = {
            let run = self.run.lock().expect("run lock poisoned");
            run.assignments.clone()
        };
        tracing::info!(workers = assignments.len(), "starting container workers");

        let drivers = assignments
            .into_iter()
            .enumerate()
            .map(|(idx, task_ids)| self.worker_driver(idx + 1, task_ids));
        join_all(drivers).await;

        let run = self.run.lock().expect("run lock poisoned");
        tracing::info!(
            completed = run.completed.len(),
            failed = run.terminal_failed.len(),
            skipped = run.skipped.len(),
            "all container workers finished"
        );
        Ok(())
    }

    async fn get_task_status(&self, task_id: &str) -> TaskStatus {
        let run = self.run.lock().expect("run lock poisoned");
        if run.completed.contains(task_id) {
            TaskStatus::Completed
        } else if run.in_progress.contains(task_id) {
            TaskStatus::InProgress
        } else if run.terminal_failed.contains(task_id) {
            TaskStatus::Failed
        } else if run.plan.as_ref().is_some_and(|p| p.task(task_id).is_some()) {
            TaskStatus::Pending
        } else {
            TaskStatus::Unknown
        }
    }

    async fn get_results(&self) -> Vec<TaskResult> {
        let run = self.run.lock().expect("run lock poisoned");
        run.results.values().cloned().collect()
    }

    async fn mark_task_complete(&self, task_id: &str, result: TaskResult) -> Result<()> {
        let mut run = self.run.lock().expect("run lock poisoned");
        run.record_result(result);
        run.in_progress.remove(task_id);
        run.completed.insert(task_id.to_owned());
        Ok(())
    }

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> Result<()> {
        let task = {
            let run = self.run.lock().expect("run lock poisoned");
            run.plan
                .as_ref()
                .context("tasks not submitted")?
                .task(task_id)
                .cloned()
        }
        .with_context(|| format!("unknown task {task_id}"))?;
        self.retry_or_terminal(&task, error).await;
        let mut run = self.run.lock().expect("run lock poisoned");
        run.in_progress.remove(task_id);
        Ok(())
    }

    async fn can_execute_task(&self, task: &Task) -> bool {
        matches!(self.gate(&task.id), Gate::Ready)
    }

    async fn get_completed_tasks(&self) -> BTreeSet<String> {
        let run = self.run.lock().expect("run lock poisoned");
        run.completed.clone()
    }

    async fn get_in_progress_tasks(&self) -> BTreeSet<String> {
        let run = self.run.lock().expect("run lock poisoned");
        run.in_progress.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        let containers = {
            let run = self.run.lock().expect("run lock poisoned");
            run.containers.clone()
        };
        for container_id in containers {
            if let Err(e) = self.runtime.stop_and_remove(&container_id).await {
                tracing::warn!(container = %container_id, error = %e, "container cleanup failed");
            }
        }
        tracing::info!("container backend cleanup complete");
        Ok(())
    }

    fn backend_info(&self) -> BTreeMap<String, String> {
        let run = self.run.lock().expect("run lock poisoned");
        let mut info = BTreeMap::from([
            ("backend".to_owned(), "containers".to_owned()),
            ("image".to_owned(), self.config.image.clone()),
            ("containers".to_owned(), run.containers.len().to_string()),
        ]);
        if let Some(network) = &self.config.network {
            info.insert("network".to_owned(), network.clone());
        }
        info
    }
}
