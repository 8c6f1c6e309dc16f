//! Cluster execution backend: file-based durable state plus an external
//! HPC job scheduler.
//!
//! The orchestrator is a cooperative, single-threaded driver: it submits
//! one job per task with the dependency edges translated into the
//! scheduler's `afterok` expression, then polls until every task is
//! terminal. All state transitions are durable (written under
//! `<output>/.state/`) before they are observable, so a post-mortem
//! observer can reconstruct the run from the state files alone.
//!
//! With an object store attached the same backend drives a managed cloud
//! cluster: task definitions and state are mirrored up after submission and
//! results are mirrored down during monitoring. The difference is purely
//! configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::jobs::{JobId, JobRequest, JobScheduler, JobState, ObjectStore, ResourceSpec, with_retries};
use crate::model::{Plan, RunContext, Task, TaskResult, TaskStatus};
use crate::plan::{DependentsIndex, topological_order};
use crate::retry::{RetryManager, RetryPolicy};
use crate::state::{StateDir, TaskDefinition};

use super::ExecutionBackend;

/// Tuning knobs for the cluster backend.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub resources: ResourceSpec,
    /// Time between monitoring passes.
    pub poll_interval: Duration,
    /// Wall-clock ceiling for the monitoring loop.
    pub max_wait: Duration,
    pub retry: RetryPolicy,
    /// Worker-body entry point the generated job scripts invoke. The
    /// program receives `--task-id`, `--state-dir`, and `--output-dir`.
    pub executor_command: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            resources: ResourceSpec::default(),
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(2 * 60 * 60),
            retry: RetryPolicy::default(),
            executor_command: "convoy-worker".to_owned(),
        }
    }
}

/// In-memory run bookkeeping. The durable truth lives in the state files;
/// this caches what the monitor needs between polls.
#[derive(Default)]
struct ClusterRun {
    plan: Option<Arc<Plan>>,
    dependents: Option<DependentsIndex>,
    /// Task ids in deterministic submission order.
    submit_order: Vec<String>,
    /// task id -> current external job id (replaced on retry).
    job_ids: BTreeMap<String, JobId>,
    /// Tasks whose retry budget is exhausted.
    terminal_failed: BTreeSet<String>,
    /// Dependents of terminally failed tasks; never submitted.
    skipped: BTreeSet<String>,
    /// Most recent failure reason per task.
    last_error: BTreeMap<String, String>,
}

/// The cluster backend.
pub struct ClusterBackend {
    scheduler: Arc<dyn JobScheduler>,
    /// Present for the cloud-cluster variant; absent for a local cluster
    /// with a shared filesystem.
    object_store: Option<Arc<dyn ObjectStore>>,
    config: ClusterConfig,
    ctx: RunContext,
    state: StateDir,
    run: Mutex<ClusterRun>,
    retry: Mutex<RetryManager>,
    variant: &'static str,
}

impl ClusterBackend {
    pub fn new(ctx: RunContext, scheduler: Arc<dyn JobScheduler>, config: ClusterConfig) -> Self {
        let state = StateDir::new(ctx.output_dir.join(".state"));
        let retry = RetryManager::new(config.retry.clone());
        Self {
            scheduler,
            object_store: None,
            config,
            ctx,
            state,
            run: Mutex::new(ClusterRun::default()),
            retry: Mutex::new(retry),
            variant: "cluster",
        }
    }

    /// Attach an object store, turning this into the cloud-cluster variant.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self.variant = "cloud-cluster";
        self
    }

    /// The durable state directory (exposed for inspection and tests).
    pub fn state_dir(&self) -> &StateDir {
        &self.state
    }

    pub async fn skipped_tasks(&self) -> Vec<String> {
        let run = self.run.lock().await;
        run.skipped.iter().cloned().collect()
    }

    /// Generate the job script for one task.
    fn job_script(&self, task: &Task) -> String {
        let state_dir = self.state.root().display().to_string();
        let output_dir = self.ctx.output_dir.display().to_string();
        let sync_down = self.object_store.as_ref().map(|store| {
            format!(
                "\n# Refresh state from the object store before execution\naws s3 sync {loc}/state/ {state_dir}/\naws s3 sync {loc}/tasks/ {state_dir}/task_definitions/\n",
                loc = store.location(),
            )
        });
        let sync_up = self.object_store.as_ref().map(|store| {
            format!(
                "\n# Publish results back to the object store\naws s3 sync {state_dir}/results/ {loc}/results/\naws s3 sync {state_dir}/ {loc}/state/\n",
                loc = store.location(),
            )
        });

        format!(
            "#!/bin/bash\n\
             # Task: {name}\n\
             # Generated: {generated}\n\
             \n\
             echo \"Starting task {id}: {name}\"\n\
             echo \"Node: $(hostname)\"\n\
             {sync_down}\
             cd {output_dir}\n\
             \n\
             {executor} --task-id \"{id}\" --state-dir \"{state_dir}\" --output-dir \"{output_dir}\"\n\
             EXIT_CODE=$?\n\
             {sync_up}\
             \n\
             echo \"Task {id} finished with exit code $EXIT_CODE\"\n\
             exit $EXIT_CODE\n",
            name = task.name,
            id = task.id,
            generated = Utc::now().to_rfc3339(),
            executor = self.config.executor_command,
            sync_down = sync_down.unwrap_or_default(),
            sync_up = sync_up.unwrap_or_default(),
        )
    }

    /// Submit one task as a cluster job. Returns the job id.
    async fn submit_job(&self, task: &Task, dep_job_ids: Vec<JobId>) -> Result<JobId> {
        let script_path = self.state.script_path(&task.id);
        tokio::fs::write(&script_path, self.job_script(task))
            .await
            .with_context(|| format!("failed to write job script for {}", task.id))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&script_path, perms)
                .with_context(|| format!("failed to chmod job script for {}", task.id))?;
        }

        let short_name: String = task
            .name
            .replace(' ', "_")
            .chars()
            .take(20)
            .collect();
        let (stdout_path, stderr_path) = self.state.log_paths(&task.id);
        let request = JobRequest {
            job_name: format!("co_{}_{}", short_name, task.id),
            script: script_path,
            dependencies: dep_job_ids,
            resources: self.config.resources.clone(),
            stdout_path,
            stderr_path,
        };
        self.scheduler.submit(&request).await
    }

    /// Submit every pending task whose dependencies all carry a job id.
    ///
    /// Called once up front and again after retry rounds, so tasks whose
    /// predecessor initially failed to submit still get their turn.
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
            let dep_job_ids = {
                let run = self.run.lock().await;
                if run.job_ids.contains_key(task_id)
                    || run.skipped.contains(task_id)
                    || run.terminal_failed.contains(task_id)
                {
                    continue;
                }
                if self.state.read_tasks()?.status_of(task_id) != TaskStatus::Pending {
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

            tracing::info!(task_id = %task.id, task_name = %task.name, "submitting job");
            match self.submit_job(task, dep_job_ids).await {
                Ok(job_id) => {
                    tracing::info!(task_id = %task.id, job_id = %job_id, "job submitted");
                    self.state.record_job(task_id, &job_id)?;
                    self.state
                        .update_task_status(task_id, TaskStatus::InProgress)?;
                    let mut run = self.run.lock().await;
                    run.job_ids.insert(task_id.clone(), job_id);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "job submission failed");
                    self.state.update_task_status(task_id, TaskStatus::Failed)?;
                }
            }
        }
        Ok(())
    }

    /// Read the result file for a finished job and settle the task.
    async fn collect_task_result(&self, task_id: &str) -> Result<()> {
        self.sync_results_down().await;
        match self.state.read_result(task_id)? {
            Some(result) if result.status == crate::model::ResultStatus::Completed => {
                self.state
                    .update_task_status(task_id, TaskStatus::Completed)?;
                tracing::info!(task_id, "task completed");
                Ok(())
            }
            Some(result) => {
                let error = result.error.unwrap_or_else(|| "failed".to_owned());
                self.handle_failure(task_id, &error).await
            }
            // The job claims success but left no result artifact.
            None => self.handle_failure(task_id, "missing result").await,
        }
    }

    /// Move a failed task into the failed bucket; the retry round decides
    /// whether it comes back.
    async fn handle_failure(&self, task_id: &str, reason: &str) -> Result<()> {
        tracing::warn!(task_id, reason, "task failed");
        let mut run = self.run.lock().await;
        run.last_error.insert(task_id.to_owned(), reason.to_owned());
        drop(run);
        self.state.update_task_status(task_id, TaskStatus::Failed)
    }

    /// Retry failed tasks that still have budget; terminally fail the rest.
    async fn retry_round(&self) -> Result<()> {
        let failed_now: Vec<String> = {
            let tasks = self.state.read_tasks()?;
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
                // Back to pending; completed dependencies are still
                // satisfied, so the resubmission reuses the recorded
                // dependency job ids.
                self.state.update_task_status(&task_id, TaskStatus::Pending)?;
                let (plan, dep_job_ids) = {
                    let mut run = self.run.lock().await;
                    run.job_ids.remove(&task_id);
                    let plan = Arc::clone(run.plan.as_ref().context("tasks not submitted")?);
                    let deps: Vec<JobId> = plan
                        .deps_of(&task_id)
                        .filter_map(|dep| run.job_ids.get(dep).cloned())
                        .collect();
                    (plan, deps)
                };
                let task = plan.task(&task_id).context("task vanished from plan")?;
                match self.submit_job(task, dep_job_ids).await {
                    Ok(job_id) => {
                        self.state.record_job(&task_id, &job_id)?;
                        self.state
                            .update_task_status(&task_id, TaskStatus::InProgress)?;
                        let mut run = self.run.lock().await;
                        run.job_ids.insert(task_id.clone(), job_id);
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "resubmission failed");
                        self.state.update_task_status(&task_id, TaskStatus::Failed)?;
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
        Ok(())
    }

    /// Settle a task as terminally failed and skip its dependents.
    async fn terminal_failure(&self, task_id: &str, reason: &str) -> Result<()> {
        tracing::error!(task_id, reason, "task failed terminally");
        if self.state.read_result(task_id)?.is_none() {
            let name = {
                let run = self.run.lock().await;
                run.plan
                    .as_ref()
                    .and_then(|p| p.task(task_id))
                    .map(|t| t.name.clone())
                    .unwrap_or_default()
            };
            self.state
                .write_result(&TaskResult::failure(task_id, &name, reason))?;
        }
        self.state.update_task_status(task_id, TaskStatus::Failed)?;

        let mut run = self.run.lock().await;
        run.terminal_failed.insert(task_id.to_owned());
        if let Some(dependents) = &run.dependents {
            let doomed = dependents.transitive_dependents(task_id);
            let completed: BTreeSet<String> =
                self.state.read_tasks()?.completed.into_iter().collect();
            for dep_id in doomed {
                if !completed.contains(&dep_id) && !run.terminal_failed.contains(&dep_id) {
                    run.skipped.insert(dep_id);
                }
            }
        }
        Ok(())
    }

    /// One monitoring pass over every active job.
    async fn check_jobs(&self) -> Result<()> {
        let active: Vec<(String, JobId)> = {
            let tasks = self.state.read_tasks()?;
            let run = self.run.lock().await;
            run.job_ids
                .iter()
                .filter(|(task_id, _)| {
                    tasks.status_of(task_id) == TaskStatus::InProgress
                })
                .map(|(t, j)| (t.clone(), j.clone()))
                .collect()
        };

        for (task_id, job_id) in active {
            match self.scheduler.describe(&job_id).await {
                Ok(JobState::Completed) => self.collect_task_result(&task_id).await?,
                Ok(JobState::Failed(native)) => {
                    self.handle_failure(&task_id, &format!("cluster job {native}"))
                        .await?
                }
                Ok(JobState::Queued | JobState::Running) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "could not check job");
                }
            }
        }
        Ok(())
    }

    /// Whether every task is settled.
    async fn all_settled(&self) -> Result<bool> {
        let tasks = self.state.read_tasks()?;
        let run = self.run.lock().await;
        let total = run.plan.as_ref().map(|p| p.len()).unwrap_or(0);
        let settled = tasks.completed.len() + run.terminal_failed.len() + run.skipped.len();
        Ok(settled >= total)
    }

    async fn sync_results_down(&self) {
        if let Some(store) = &self.object_store {
            let results_dir = self.state.results_dir();
            let outcome = with_retries("object-store results sync", 3, || {
                let store = Arc::clone(store);
                let dir = results_dir.clone();
                async move { store.sync_down("results", &dir).await }
            })
            .await;
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "result sync from object store failed");
            }
        }
    }

    async fn sync_state_up(&self) {
        if let Some(store) = &self.object_store {
            let root = self.state.root().to_path_buf();
            let defs = self.state.task_definitions_dir();
            for (dir, prefix) in [(defs, "tasks"), (root, "state")] {
                let outcome = with_retries("object-store state sync", 3, || {
                    let store = Arc::clone(store);
                    let dir = dir.clone();
                    async move { store.sync_up(&dir, prefix).await }
                })
                .await;
                if let Err(e) = outcome {
                    tracing::warn!(error = %e, "state sync to object store failed");
                }
            }
        }
    }

    /// Mark every non-terminal task as failed with a timeout error.
    async fn fail_remaining_with_timeout(&self) -> Result<()> {
        let unfinished: Vec<String> = {
            let tasks = self.state.read_tasks()?;
            let run = self.run.lock().await;
            run.plan
                .as_ref()
                .map(|p| {
                    p.tasks
                        .iter()
                        .map(|t| t.id.clone())
                        .filter(|id| {
                            !tasks.completed.contains(id)
                                && !run.terminal_failed.contains(id)
                                && !run.skipped.contains(id)
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        for task_id in unfinished {
            let name = {
                let run = self.run.lock().await;
                run.plan
                    .as_ref()
                    .and_then(|p| p.task(&task_id))
                    .map(|t| t.name.clone())
                    .unwrap_or_default()
            };
            self.state
                .write_result(&TaskResult::failure(&task_id, &name, "timeout"))?;
            self.state.update_task_status(&task_id, TaskStatus::Failed)?;
            let mut run = self.run.lock().await;
            run.terminal_failed.insert(task_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for ClusterBackend {
    fn name(&self) -> &str {
        self.variant
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!(run_id = %self.ctx.run_id, "initializing cluster backend");
        self.state.init(&self.ctx.run_id, self.variant)?;
        if let Some(store) = &self.object_store {
            let marker = tokio::fs::read(self.state.marker_path())
                .await
                .context("failed to read run marker")?;
            with_retries("object-store marker upload", 3, || {
                let store = Arc::clone(store);
                let bytes = marker.clone();
                async move { store.put("state/marker.json", &bytes).await }
            })
            .await?;
            tracing::info!(location = %store.location(), "object store attached");
        }
        tracing::info!(state_dir = %self.state.root().display(), "cluster backend initialized");
        Ok(())
    }

    async fn submit_tasks(&self, plan: &Plan, ctx: &RunContext) -> Result<()> {
        let mut tasks_state = self.state.read_tasks()?;
        for task in &plan.tasks {
            self.state.write_task_definition(&TaskDefinition {
                task: task.clone(),
                requirements: ctx.requirements.clone(),
                use_real_executors: ctx.use_real_executors,
                output_dir: ctx.output_dir.display().to_string(),
                plan: plan.clone(),
                run_id: ctx.run_id.clone(),
            })?;
            tasks_state.set_status(&task.id, TaskStatus::Pending);
        }
        self.state.write_tasks(&tasks_state)?;

        let mut run = self.run.lock().await;
        run.submit_order = topological_order(plan)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        run.dependents = Some(DependentsIndex::new(plan));
        run.plan = Some(Arc::new(plan.clone()));
        drop(run);

        self.sync_state_up().await;
        tracing::info!(tasks = plan.len(), "submitted tasks to cluster backend");
        Ok(())
    }

    async fn wait_for_completion(&self, max_executors: usize) -> Result<()> {
        // Concurrency is the external scheduler's responsibility; the
        // budget is logged as a hint only.
        tracing::info!(budget = max_executors, "executing tasks with cluster backend");

        self.submit_ready_tasks().await?;
        self.sync_state_up().await;

        let started = tokio::time::Instant::now();
        loop {
            self.check_jobs().await?;
            self.retry_round().await?;
            // Pending tasks whose predecessors only now have job ids.
            self.submit_ready_tasks().await?;

            let running = self
                .scheduler
                .list_active()
                .await
                .map(|jobs| jobs.len())
                .unwrap_or(0);
            let tasks = self.state.read_tasks()?;
            tracing::info!(
                running,
                in_progress = tasks.in_progress.len(),
                completed = tasks.completed.len(),
                failed = tasks.failed.len(),
                "cluster job status"
            );

            if self.all_settled().await? {
                break;
            }
            if started.elapsed() >= self.config.max_wait {
                tracing::warn!("timeout waiting for cluster jobs");
                self.fail_remaining_with_timeout().await?;
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.sync_state_up().await;
        let tasks = self.state.read_tasks()?;
        tracing::info!(completed = tasks.completed.len(), "all cluster jobs finished");
        Ok(())
    }

    async fn get_task_status(&self, task_id: &str) -> TaskStatus {
        self.state
            .read_tasks()
            .map(|t| t.status_of(task_id))
            .unwrap_or(TaskStatus::Unknown)
    }

    async fn get_results(&self) -> Vec<TaskResult> {
        self.sync_results_down().await;
        self.state.read_all_results().unwrap_or_default()
    }

    async fn mark_task_complete(&self, task_id: &str, result: TaskResult) -> Result<()> {
        // Durably record the result before the transition is observable.
        self.state.write_result(&result)?;
        self.state.update_task_status(task_id, TaskStatus::Completed)
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
        self.state
            .write_result(&TaskResult::failure(task_id, &name, error))?;
        self.state.update_task_status(task_id, TaskStatus::Failed)
    }

    async fn can_execute_task(&self, task: &Task) -> bool {
        let Ok(tasks) = self.state.read_tasks() else {
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
        self.state
            .read_tasks()
            .map(|t| t.completed.into_iter().collect())
            .unwrap_or_default()
    }

    async fn get_in_progress_tasks(&self) -> BTreeSet<String> {
        self.state
            .read_tasks()
            .map(|t| t.in_progress.into_iter().collect())
            .unwrap_or_default()
    }

    async fn cleanup(&self) -> Result<()> {
        self.sync_state_up().await;
        if let Some(store) = &self.object_store {
            tracing::info!(location = %store.location(), "results mirrored to object store");
        }
        tracing::info!("cluster backend cleanup complete");
        Ok(())
    }

    fn backend_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::from([
            ("backend".to_owned(), self.variant.to_owned()),
            ("run_id".to_owned(), self.ctx.run_id.clone()),
            (
                "state_dir".to_owned(),
                self.state.root().display().to_string(),
            ),
            (
                "partition".to_owned(),
                self.config.resources.partition.clone(),
            ),
        ]);
        if let Some(store) = &self.object_store {
            info.insert("object_store".to_owned(), store.location());
        }
        info
    }
}
