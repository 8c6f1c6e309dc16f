//! Cloud batch execution backend: object-store state plus a managed batch
//! service.
//!
//! Task definitions and state snapshots live under the store root
//! (`<bucket>/<prefix>/<run_id>/`) in three logical areas: `tasks/`,
//! `state/`, and `results/`. There is no locking primitive; consistency
//! comes from single-writer discipline per key (the orchestrator owns the
//! state keys, each worker container owns its own result key). A local
//! mirror under `<output>/.batch_state/` keeps the same layout so the run
//! can be inspected without store access.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::OrchestratorError;
use crate::jobs::{
    BatchJobState, BatchService, BatchSubmitRequest, JobId, ObjectStore, with_retries,
};
use crate::model::{Plan, ResultStatus, RunContext, Task, TaskResult, TaskStatus};
use crate::plan::{DependentsIndex, topological_order};
use crate::retry::{RetryManager, RetryPolicy};
use crate::state::{StateDir, TaskDefinition};

use super::ExecutionBackend;

/// Native describe calls accept at most this many job ids.
const DESCRIBE_CHUNK: usize = 100;

/// Tuning knobs for the batch backend.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub job_queue: String,
    pub job_definition: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    /// Per-job attempt ceiling in seconds; 0 disables it.
    pub job_timeout_secs: u32,
    /// Time between monitoring passes.
    pub poll_interval: Duration,
    /// Wall-clock ceiling for the monitoring loop.
    pub max_wait: Duration,
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            job_queue: String::new(),
            job_definition: String::new(),
            vcpus: 1,
            memory_mb: 2048,
            job_timeout_secs: 3600,
            poll_interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(2 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct BatchRun {
    plan: Option<Arc<Plan>>,
    dependents: Option<DependentsIndex>,
    submit_order: Vec<String>,
    /// task id -> current batch job id (replaced on retry).
    job_ids: BTreeMap<String, JobId>,
    terminal_failed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    /// Results collected from the store, by task id.
    results: BTreeMap<String, TaskResult>,
    /// Most recent failure reason per task.
    last_error: BTreeMap<String, String>,
}

/// The cloud batch backend.
pub struct BatchBackend {
    service: Arc<dyn BatchService>,
    store: Arc<dyn ObjectStore>,
    config: BatchConfig,
    ctx: RunContext,
    /// Local mirror of the durable state, same layout as the cluster
    /// variant (scripts/ and logs/ stay empty here).
    local: StateDir,
    run: Mutex<BatchRun>,
    retry: Mutex<RetryManager>,
}

impl BatchBackend {
    pub fn new(
        ctx: RunContext,
        service: Arc<dyn BatchService>,
        store: Arc<dyn ObjectStore>,
        config: BatchConfig,
    ) -> Self {
        let local = StateDir::new(ctx.output_dir.join(".batch_state"));
        let retry = RetryManager::new(config.retry.clone());
        Self {
            service,
            store,
            config,
            ctx,
            local,
            run: Mutex::new(BatchRun::default()),
            retry: Mutex::new(retry),
        }
    }

    /// The local state mirror (exposed for inspection and tests).
    pub fn state_dir(&self) -> &StateDir {
        &self.local
    }

    pub async fn skipped_tasks(&self) -> Vec<String> {
        let run = self.run.lock().await;
        run.skipped.iter().cloned().collect()
    }

    /// Upload the canonical state files to the store's `state/` area.
    async fn push_state(&self) {
        for (path, key) in [
            (self.local.tasks_path(), "state/tasks.json"),
            (self.local.jobs_path(), "state/jobs.json"),
        ] {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let outcome = with_retries("state upload", 3, || {
                let store = Arc::clone(&self.store);
                let bytes = bytes.clone();
                async move { store.put(key, &bytes).await }
            })
            .await;
            if let Err(e) = outcome {
                tracing::warn!(key, error = %e, "state upload failed");
            }
        }
    }

    /// Submit one task as a batch job.
    async fn submit_job(&self, task: &Task, depends_on: Vec<JobId>) -> Result<JobId> {
        let request = BatchSubmitRequest {
            job_name: format!("co_{}", task.id),
            job_queue: self.config.job_queue.clone(),
            job_definition: self.config.job_definition.clone(),
            depends_on,
            vcpus: self.config.vcpus,
            memory_mb: self.config.memory_mb,
            timeout_secs: self.config.job_timeout_secs,
            environment: vec![
                ("CONVOY_TASK_ID".to_owned(), task.id.clone()),
                ("CONVOY_RUN_ID".to_owned(), self.ctx.run_id.clone()),
                ("CONVOY_STATE_LOCATION".to_owned(), self.store.location()),
                ("CONVOY_OUTPUT_DIR".to_owned(), "/output".to_owned()),
                (
                    "CONVOY_USE_REAL_EXECUTORS".to_owned(),
                    self.ctx.use_real_executors.to_string(),
                ),
            ],
        };
        self.service.submit(&request).await
    }

    /// Submit every pending task whose predecessors all hold a job id.
    async fn submit_ready_tasks(&self) -> Result<()> {
        let (plan, submit_order) = {
            let run = self.run.lock().await;
            (
                Arc::clone(run.plan.as_ref().context("tasks not submitted")?),
                run.submit_order.clone(),
            )
        };

        for task_id in &submit_order {
            let task = plan.task(task_id).context("task vanished from plan")?;
            let depends_on = {
                let run = self.run.lock().await;
                if run.job_ids.contains_key(task_id)
                    || run.skipped.contains(task_id)
                    || run.terminal_failed.contains(task_id)
                {
                    continue;
                }
                if self.local.read_tasks()?.status_of(task_id) != TaskStatus::Pending {
                    continue;
                }
                let mut deps = Vec::new();
                let mut ready = true;
                for dep in plan.deps_of(task_id) {
                    match run.job_ids.get(dep) {
                        Some(job_id) => deps.push(job_id.clone()),
                        None => {
                            ready = false;
                            break;
                        }
                    }
                }
                if !ready {
                    continue;
                }
                deps
            };

            tracing::info!(task_id = %task.id, task_name = %task.name, "submitting batch job");
            match self.submit_job(task, depends_on).await {
                Ok(job_id) => {
                    tracing::info!(task_id = %task.id, job_id = %job_id, "batch job submitted");
                    self.local.record_job(task_id, &job_id)?;
                    self.local
                        .update_task_status(task_id, TaskStatus::InProgress)?;
                    let mut run = self.run.lock().await;
                    run.job_ids.insert(task_id.clone(), job_id);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "batch submission failed");
                    self.local.update_task_status(task_id, TaskStatus::Failed)?;
                }
            }
        }
        self.push_state().await;
        Ok(())
    }

    /// Fetch the result object for a succeeded job and settle the task.
    async fn collect_task_result(&self, task_id: &str) -> Result<()> {
        let key = format!("results/{task_id}.json");
        let fetched = with_retries("result download", 3, || {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            async move { store.get(&key).await }
        })
        .await;

        match fetched {
            Ok(bytes) => {
                let result: TaskResult = serde_json::from_slice(&bytes).map_err(|e| {
                    OrchestratorError::StateCorrupted {
                        path: self.local.result_path(task_id),
                        reason: e.to_string(),
                    }
                })?;
                if result.status == ResultStatus::Completed {
                    self.local.write_result(&result)?;
                    self.local
                        .update_task_status(task_id, TaskStatus::Completed)?;
                    let mut run = self.run.lock().await;
                    run.results.insert(task_id.to_owned(), result);
                    tracing::info!(task_id, "task completed");
                    Ok(())
                } else {
                    let error = result.error.unwrap_or_else(|| "failed".to_owned());
                    self.handle_failure(task_id, &error).await
                }
            }
            // The job succeeded but its result object is absent.
            Err(_) => self.handle_failure(task_id, "missing result").await,
        }
    }

    async fn handle_failure(&self, task_id: &str, reason: &str) -> Result<()> {
        tracing::warn!(task_id, reason, "task failed");
        let mut run = self.run.lock().await;
        run.last_error.insert(task_id.to_owned(), reason.to_owned());
        drop(run);
        self.local.update_task_status(task_id, TaskStatus::Failed)
    }

    /// One monitoring pass: describe active jobs in chunks and apply the
    /// observed transitions.
    async fn check_jobs(&self) -> Result<()> {
        let active: Vec<(String, JobId)> = {
            let tasks = self.local.read_tasks()?;
            let run = self.run.lock().await;
            run.job_ids
                .iter()
                .filter(|(task_id, _)| tasks.status_of(task_id) == TaskStatus::InProgress)
                .map(|(t, j)| (t.clone(), j.clone()))
                .collect()
        };
        if active.is_empty() {
            return Ok(());
        }

        let by_job: BTreeMap<&str, &str> = active
            .iter()
            .map(|(t, j)| (j.as_str(), t.as_str()))
            .collect();

        let job_ids: Vec<JobId> = active.iter().map(|(_, j)| j.clone()).collect();
        for chunk in job_ids.chunks(DESCRIBE_CHUNK) {
            let statuses = match self.service.describe(chunk).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    tracing::warn!(error = %e, "could not describe batch jobs");
                    continue;
                }
            };
            for status in statuses {
                let Some(task_id) = by_job.get(status.job_id.as_str()).copied() else {
                    continue;
                };
                match status.state {
                    BatchJobState::Succeeded => self.collect_task_result(task_id).await?,
                    BatchJobState::Failed => {
                        let reason = status.reason.as_deref().unwrap_or("unknown error");
                        self.handle_failure(task_id, reason).await?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Retry failed tasks with remaining budget; terminally fail the rest.
    ///
    /// Resubmission drops dependency entries whose tasks have already
    /// completed: they are satisfied facts, and the service may have
    /// garbage-collected their job ids.
    async fn retry_round(&self) -> Result<()> {
        let failed_now: Vec<String> = {
            let tasks = self.local.read_tasks()?;
            let run = self.run.lock().await;
            tasks
                .failed
                .iter()
                .filter(|id| !run.terminal_failed.contains(*id))
                .cloned()
                .collect()
        };

        for task_id in failed_now {
            let (should_retry, delay) = {
                let mut retry = self.retry.lock().await;
                if retry.should_retry(&task_id) {
                    let delay = retry.delay_for(&task_id);
                    let attempt = retry.record_attempt(&task_id);
                    tracing::info!(
                        task_id = %task_id,
                        attempt,
                        max_retries = retry.policy().max_retries,
                        "retrying task"
                    );
                    (true, delay)
                } else {
                    (false, Duration::ZERO)
                }
            };

            if should_retry {
                tokio::time::sleep(delay).await;
                self.local.update_task_status(&task_id, TaskStatus::Pending)?;
                let (plan, depends_on) = {
                    let mut run = self.run.lock().await;
                    run.job_ids.remove(&task_id);
                    let plan = Arc::clone(run.plan.as_ref().context("tasks not submitted")?);
                    let completed: BTreeSet<String> =
                        self.local.read_tasks()?.completed.into_iter().collect();
                    let deps: Vec<JobId> = plan
                        .deps_of(&task_id)
                        .filter(|dep| !completed.contains(*dep))
                        .filter_map(|dep| run.job_ids.get(dep).cloned())
                        .collect();
                    (plan, deps)
                };
                let task = plan.task(&task_id).context("task vanished from plan")?;
                match self.submit_job(task, depends_on).await {
                    Ok(job_id) => {
                        self.local.record_job(&task_id, &job_id)?;
                        self.local
                            .update_task_status(&task_id, TaskStatus::InProgress)?;
                        let mut run = self.run.lock().await;
                        run.job_ids.insert(task_id.clone(), job_id);
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "resubmission failed");
                        self.local.update_task_status(&task_id, TaskStatus::Failed)?;
                    }
                }
            } else {
                let reason = {
                    let run = self.run.lock().await;
                    run.last_error
                        .get(&task_id)
                        .cloned()
                        .unwrap_or_else(|| "retries exhausted".to_owned())
                };
                self.terminal_failure(&task_id, &reason).await?;
            }
        }
        self.push_state().await;
        Ok(())
    }

    async fn terminal_failure(&self, task_id: &str, reason: &str) -> Result<()> {
        tracing::error!(task_id, reason, "task failed terminally");
        let mut run = self.run.lock().await;
        let name = run
            .plan
            .as_ref()
            .and_then(|p| p.task(task_id))
            .map(|t| t.name.clone())
            .unwrap_or_default();
        if !run.results.contains_key(task_id) {
            let failure = TaskResult::failure(task_id, &name, reason);
            self.local.write_result(&failure)?;
            run.results.insert(task_id.to_owned(), failure);
        }
        run.terminal_failed.insert(task_id.to_owned());

        if let Some(dependents) = &run.dependents {
            let doomed = dependents.transitive_dependents(task_id);
            let completed: BTreeSet<String> =
                self.local.read_tasks()?.completed.into_iter().collect();
            for dep_id in doomed {
                if !completed.contains(&dep_id) && !run.terminal_failed.contains(&dep_id) {
                    run.skipped.insert(dep_id);
                }
            }
        }
        Ok(())
    }

    async fn all_settled(&self) -> Result<bool> {
        let tasks = self.local.read_tasks()?;
        let run = self.run.lock().await;
        let total = run.plan.as_ref().map(|p| p.len()).unwrap_or(0);
        let settled = tasks.completed.len() + run.terminal_failed.len() + run.skipped.len();
        Ok(settled >= total)
    }

    async fn fail_remaining_with_timeout(&self) -> Result<()> {
        let unfinished: Vec<(String, String)> = {
            let tasks = self.local.read_tasks()?;
            let run = self.run.lock().await;
            run.plan
                .as_ref()
                .map(|p| {
                    p.tasks
                        .iter()
                        .filter(|t| {
                            !tasks.completed.contains(&t.id)
                                && !run.terminal_failed.contains(&t.id)
                                && !run.skipped.contains(&t.id)
                        })
                        .map(|t| (t.id.clone(), t.name.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (task_id, name) in unfinished {
            let failure = TaskResult::failure(&task_id, &name, "timeout");
            self.local.write_result(&failure)?;
            self.local.update_task_status(&task_id, TaskStatus::Failed)?;
            let mut run = self.run.lock().await;
            run.results.insert(task_id.clone(), failure);
            run.terminal_failed.insert(task_id);
        }
        Ok(())
    }

    /// Bulk-sync `results/` and `files/` down and load every result.
    async fn collect_all_results(&self) {
        tracing::info!("collecting results from object store");
        let results_dir = self.local.results_dir();
        if let Err(e) = self.store.sync_down("results", &results_dir).await {
            tracing::warn!(error = %e, "result sync failed");
        }

        let files_dir = self.ctx.output_dir.join("generated_files");
        if let Err(e) = self.store.sync_down("files", &files_dir).await {
            tracing::warn!(error = %e, "generated-files sync failed");
        }

        match self.local.read_all_results() {
            Ok(results) => {
                let mut run = self.run.lock().await;
                for result in results {
                    run.results.insert(result.task_id.clone(), result);
                }
                tracing::info!(count = run.results.len(), "results collected");
            }
            Err(e) => tracing::warn!(error = %e, "could not load result files"),
        }
    }
}

#[async_trait]
impl ExecutionBackend for BatchBackend {
    fn name(&self) -> &str {
        "cloud-batch"
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!(run_id = %self.ctx.run_id, "initializing batch backend");
        self.local.init(&self.ctx.run_id, "cloud-batch")?;

        // Fail fast when the external resources are not reachable.
        self.service
            .validate(&self.config.job_queue, &self.config.job_definition)
            .await
            .map_err(|e| OrchestratorError::BackendUnavailable {
                backend: "cloud-batch".to_owned(),
                reason: format!("{e:#}"),
            })?;

        let marker = tokio::fs::read(self.local.marker_path())
            .await
            .context("failed to read run marker")?;
        with_retries("marker upload", 3, || {
            let store = Arc::clone(&self.store);
            let bytes = marker.clone();
            async move { store.put("state/marker.json", &bytes).await }
        })
        .await
        .map_err(|e| OrchestratorError::BackendUnavailable {
            backend: "cloud-batch".to_owned(),
            reason: format!("object store unreachable: {e:#}"),
        })?;

        tracing::info!(
            job_queue = %self.config.job_queue,
            job_definition = %self.config.job_definition,
            location = %self.store.location(),
            "batch backend initialized"
        );
        Ok(())
    }

    async fn submit_tasks(&self, plan: &Plan, ctx: &RunContext) -> Result<()> {
        tracing::info!("uploading task definitions to object store");
        let mut tasks_state = self.local.read_tasks()?;
        for task in &plan.tasks {
            let def = TaskDefinition {
                task: task.clone(),
                requirements: ctx.requirements.clone(),
                use_real_executors: ctx.use_real_executors,
                output_dir: ctx.output_dir.display().to_string(),
                plan: plan.clone(),
                run_id: ctx.run_id.clone(),
            };
            self.local.write_task_definition(&def)?;
            let bytes = serde_json::to_vec_pretty(&def)?;
            let key = format!("tasks/{}.json", task.id);
            with_retries("task definition upload", 3, || {
                let store = Arc::clone(&self.store);
                let bytes = bytes.clone();
                let key = key.clone();
                async move { store.put(&key, &bytes).await }
            })
            .await?;
            tasks_state.set_status(&task.id, TaskStatus::Pending);
        }
        self.local.write_tasks(&tasks_state)?;

        let mut run = self.run.lock().await;
        run.submit_order = topological_order(plan)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        run.dependents = Some(DependentsIndex::new(plan));
        run.plan = Some(Arc::new(plan.clone()));
        drop(run);

        self.push_state().await;
        tracing::info!(tasks = plan.len(), "uploaded task definitions");
        Ok(())
    }

    async fn wait_for_completion(&self, max_executors: usize) -> Result<()> {
        // Concurrency is the batch service's responsibility; the budget is
        // a logging hint only.
        tracing::info!(budget = max_executors, "executing tasks with batch backend");

        self.submit_ready_tasks().await?;

        let started = tokio::time::Instant::now();
        loop {
            self.check_jobs().await?;
            self.retry_round().await?;
            self.submit_ready_tasks().await?;

            let tasks = self.local.read_tasks()?;
            tracing::info!(
                in_progress = tasks.in_progress.len(),
                completed = tasks.completed.len(),
                failed = tasks.failed.len(),
                "batch job status"
            );

            if self.all_settled().await? {
                break;
            }
            if started.elapsed() >= self.config.max_wait {
                tracing::warn!("timeout waiting for batch jobs");
                self.fail_remaining_with_timeout().await?;
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.collect_all_results().await;
        self.push_state().await;
        let tasks = self.local.read_tasks()?;
        tracing::info!(completed = tasks.completed.len(), "all batch jobs finished");
        Ok(())
    }

    async fn get_task_status(&self, task_id: &str) -> TaskStatus {
        self.local
            .read_tasks()
            .map(|t| t.status_of(task_id))
            .unwrap_or(TaskStatus::Unknown)
    }

    async fn get_results(&self) -> Vec<TaskResult> {
        let run = self.run.lock().await;
        let Some(plan) = &run.plan else {
            return Vec::new();
        };
        let statuses = self.local.read_tasks().unwrap_or_default();
        let mut results = Vec::new();
        for task in &plan.tasks {
            if let Some(result) = run.results.get(&task.id) {
                results.push(result.clone());
            } else if statuses.status_of(&task.id) == TaskStatus::Failed {
                results.push(TaskResult::failure(
                    &task.id,
                    &task.name,
                    "job failed or result not available",
                ));
            }
        }
        results
    }

    async fn mark_task_complete(&self, task_id: &str, result: TaskResult) -> Result<()> {
        self.local.write_result(&result)?;
        self.local.update_task_status(task_id, TaskStatus::Completed)?;
        let mut run = self.run.lock().await;
        run.results.insert(task_id.to_owned(), result);
        Ok(())
    }

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> Result<()> {
        let name = {
            let run = self.run.lock().await;
            run.plan
                .as_ref()
                .and_then(|p| p.task(task_id))
                .map(|t| t.name.clone())
                .unwrap_or_default()
        };
        let failure = TaskResult::failure(task_id, &name, error);
        self.local.write_result(&failure)?;
        self.local.update_task_status(task_id, TaskStatus::Failed)?;
        let mut run = self.run.lock().await;
        run.results.insert(task_id.to_owned(), failure);
        Ok(())
    }

    async fn can_execute_task(&self, task: &Task) -> bool {
        let Ok(tasks) = self.local.read_tasks() else {
            return false;
        };
        let completed: BTreeSet<&str> = tasks.completed.iter().map(String::as_str).collect();
        let run = self.run.lock().await;
        match &run.plan {
            Some(plan) => plan.deps_of(&task.id).all(|dep| completed.contains(dep)),
            None => true,
        }
    }

    async fn get_completed_tasks(&self) -> BTreeSet<String> {
        self.local
            .read_tasks()
            .map(|t| t.completed.into_iter().collect())
            .unwrap_or_default()
    }

    async fn get_in_progress_tasks(&self) -> BTreeSet<String> {
        self.local
            .read_tasks()
            .map(|t| t.in_progress.into_iter().collect())
            .unwrap_or_default()
    }

    async fn cleanup(&self) -> Result<()> {
        self.push_state().await;
        let results_dir = self.local.results_dir();
        if let Err(e) = self.store.sync_up(&results_dir, "results").await {
            tracing::warn!(error = %e, "final result sync failed");
        }
        tracing::info!(location = %self.store.location(), "batch backend cleanup complete");
        Ok(())
    }

    fn backend_info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("backend".to_owned(), "cloud-batch".to_owned()),
            ("run_id".to_owned(), self.ctx.run_id.clone()),
            ("job_queue".to_owned(), self.config.job_queue.clone()),
            (
                "job_definition".to_owned(),
                self.config.job_definition.clone(),
            ),
            ("location".to_owned(), self.store.location()),
            ("vcpus".to_owned(), self.config.vcpus.to_string()),
            ("memory_mb".to_owned(), self.config.memory_mb.to_string()),
        ])
    }
}
