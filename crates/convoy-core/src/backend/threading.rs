//! In-memory execution backend: a pool of in-process workers over shared
//! state tables.
//!
//! Workers run a work-stealing pickup loop: under the state lock they scan
//! tasks in claim order (priority ascending, insertion order ascending) and
//! claim the first one whose dependencies are all completed, then execute
//! the worker body with no locks held. Failed attempts re-enter through the
//! shared retry path; dependents of a terminally failed task are marked
//! skipped so workers can drain and exit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::exec::{WorkerBody, WorkerContext};
use crate::model::{Plan, RunContext, Task, TaskResult, TaskStatus};
use crate::plan::DependentsIndex;
use crate::retry::{RetryManager, RetryPolicy};

use super::ExecutionBackend;

/// Tuning knobs for the worker pool.
#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    /// Sleep between pickup attempts when no task is ready.
    pub idle_recheck: Duration,
    /// Delay between successive worker starts, spreading the initial
    /// dependency-scan contention.
    pub stagger: Duration,
    pub retry: RetryPolicy,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            idle_recheck: Duration::from_millis(500),
            stagger: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

/// Mutable run state, guarded by the task lock.
#[derive(Default)]
struct TaskTable {
    plan: Option<Arc<Plan>>,
    ctx: Option<RunContext>,
    /// Tasks in claim order: priority ascending, insertion order ascending.
    claim_order: Vec<usize>,
    dependents: Option<DependentsIndex>,
    completed: BTreeSet<String>,
    in_progress: BTreeSet<String>,
    terminal_failed: BTreeSet<String>,
    /// Dependents of terminally failed tasks; never claimable.
    skipped: BTreeSet<String>,
}

impl TaskTable {
    fn plan(&self) -> &Arc<Plan> {
        self.plan.as_ref().expect("tasks not submitted")
    }

    fn deps_completed(&self, task_id: &str) -> bool {
        self.plan()
            .deps_of(task_id)
            .all(|dep| self.completed.contains(dep))
    }

    /// Claim the first ready task, transitioning it to in-progress.
    fn claim_next(&mut self) -> Option<Task> {
        let plan = Arc::clone(self.plan());
        for &idx in &self.claim_order {
            let task = &plan.tasks[idx];
            let id = task.id.as_str();
            if self.completed.contains(id)
                || self.in_progress.contains(id)
                || self.terminal_failed.contains(id)
                || self.skipped.contains(id)
            {
                continue;
            }
            if self.deps_completed(id) {
                self.in_progress.insert(id.to_owned());
                return Some(task.clone());
            }
        }
        None
    }

    /// Whether every task has reached a terminal or skipped state.
    fn drained(&self) -> bool {
        let total = self.plan.as_ref().map(|p| p.len()).unwrap_or(0);
        self.completed.len() + self.terminal_failed.len() + self.skipped.len() >= total
    }

    /// Mark dependents of a terminally failed task as skipped, so the pool
    /// does not wait forever for tasks that can never become ready.
    fn propagate_skip(&mut self, failed_id: &str) {
        let Some(dependents) = &self.dependents else {
            return;
        };
        for dep_id in dependents.transitive_dependents(failed_id) {
            if !self.completed.contains(&dep_id)
                && !self.in_progress.contains(&dep_id)
                && !self.terminal_failed.contains(&dep_id)
            {
                self.skipped.insert(dep_id);
            }
        }
    }
}

struct Inner {
    worker_body: Arc<dyn WorkerBody>,
    config: ThreadingConfig,
    /// `task_lock` of the run: guards the state table.
    state: Mutex<TaskTable>,
    /// Separate lock for the result list so the pickup loop never holds
    /// both.
    results: Mutex<Vec<TaskResult>>,
    retry: Mutex<RetryManager>,
}

impl Inner {
    /// Insert or replace (on retry) the result for a task.
    fn record_result(&self, result: TaskResult) {
        let mut results = self.results.lock().expect("results lock poisoned");
        if let Some(existing) = results.iter_mut().find(|r| r.task_id == result.task_id) {
            *existing = result;
        } else {
            results.push(result);
        }
    }
}

/// The in-memory backend.
pub struct ThreadingBackend {
    inner: Arc<Inner>,
}

impl ThreadingBackend {
    pub fn new(worker_body: Arc<dyn WorkerBody>, config: ThreadingConfig) -> Self {
        let retry = RetryManager::new(config.retry.clone());
        Self {
            inner: Arc::new(Inner {
                worker_body,
                config,
                state: Mutex::new(TaskTable::default()),
                results: Mutex::new(Vec::new()),
                retry: Mutex::new(retry),
            }),
        }
    }

    /// Attempts used per task, for reporting and tests.
    pub fn attempts_used(&self) -> BTreeMap<String, u32> {
        let retry = self.inner.retry.lock().expect("retry lock poisoned");
        retry
            .attempts_used()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Task ids skipped because an ancestor failed terminally.
    pub fn skipped_tasks(&self) -> Vec<String> {
        let state = self.inner.state.lock().expect("task lock poisoned");
        state.skipped.iter().cloned().collect()
    }
}

/// One worker's pickup loop.
async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    tracing::debug!(worker = worker_id, "worker started");
    loop {
        let claimed = {
            let mut state = inner.state.lock().expect("task lock poisoned");
            let task = state.claim_next();
            let ctx = state.ctx.clone();
            task.zip(ctx)
        };

        match claimed {
            Some((task, run_ctx)) => {
                execute_one(&inner, &task, run_ctx, worker_id).await;
            }
            None => {
                let drained = {
                    let state = inner.state.lock().expect("task lock poisoned");
                    state.drained()
                };
                if drained {
                    tracing::debug!(worker = worker_id, "all tasks processed, shutting down");
                    break;
                }
                tokio::time::sleep(inner.config.idle_recheck).await;
            }
        }
    }
}

/// Run one claimed task through the worker body and record the outcome.
async fn execute_one(inner: &Arc<Inner>, task: &Task, run_ctx: RunContext, worker_id: usize) {
    tracing::info!(
        task_id = %task.id,
        task_name = %task.name,
        worker = worker_id,
        "starting task"
    );

    let task_output_dir = run_ctx
        .output_dir
        .join(format!("executor_{worker_id}"))
        .join(&task.id);
    let worker_ctx = WorkerContext {
        run: run_ctx,
        worker_id,
        task_output_dir,
    };

    // No lock is held across this await.
    let outcome = inner.worker_body.execute(task, &worker_ctx).await;

    match outcome {
        Ok(result) if result.status == crate::model::ResultStatus::Completed => {
            complete_task(inner, task, result);
        }
        Ok(result) => {
            let error = result.error.clone().unwrap_or_else(|| "failed".to_owned());
            fail_task(inner, task, &error).await;
        }
        Err(e) => {
            fail_task(inner, task, &format!("{e:#}")).await;
        }
    }
}

fn complete_task(inner: &Arc<Inner>, task: &Task, result: TaskResult) {
    // The result is recorded before the completion becomes visible.
    inner.record_result(result);
    let mut state = inner.state.lock().expect("task lock poisoned");
    state.in_progress.remove(&task.id);
    state.completed.insert(task.id.clone());
    tracing::info!(task_id = %task.id, "task completed");
}

/// Retry path for a failed attempt.
///
/// While budget remains the worker holds the claim through the backoff
/// sleep, then releases the task back to pending. Otherwise the task is
/// terminal: the failure result is recorded and dependents are skipped.
async fn fail_task(inner: &Arc<Inner>, task: &Task, error: &str) {
    let retry_delay = {
        let mut retry = inner.retry.lock().expect("retry lock poisoned");
        if retry.should_retry(&task.id) {
            let delay = retry.delay_for(&task.id);
            let attempt = retry.record_attempt(&task.id);
            tracing::warn!(
                task_id = %task.id,
                attempt,
                max_retries = retry.policy().max_retries,
                error,
                "task failed, will retry"
            );
            Some(delay)
        } else {
            None
        }
    };

    match retry_delay {
        Some(delay) => {
            // Keep the claim during the backoff so no other worker picks
            // the task up early, then release it back to pending.
            tokio::time::sleep(delay).await;
            let mut state = inner.state.lock().expect("task lock poisoned");
            state.in_progress.remove(&task.id);
        }
        None => {
            tracing::error!(task_id = %task.id, error, "task failed terminally");
            inner.record_result(TaskResult::failure(&task.id, &task.name, error));
            let mut state = inner.state.lock().expect("task lock poisoned");
            state.in_progress.remove(&task.id);
            state.terminal_failed.insert(task.id.clone());
            state.propagate_skip(&task.id);
        }
    }
}

#[async_trait]
impl ExecutionBackend for ThreadingBackend {
    fn name(&self) -> &str {
        "threading"
    }

    async fn initialize(&self) -> Result<()> {
        let mut state = self.inner.state.lock().expect("task lock poisoned");
        *state = TaskTable::default();
        self.inner
            .results
            .lock()
            .expect("results lock poisoned")
            .clear();
        tracing::info!("threading backend initialized");
        Ok(())
    }

    async fn submit_tasks(&self, plan: &Plan, ctx: &RunContext) -> Result<()> {
        let mut state = self.inner.state.lock().expect("task lock poisoned");
        let mut claim_order: Vec<usize> = (0..plan.tasks.len()).collect();
        claim_order.sort_by_key(|&i| (plan.tasks[i].priority, i));
        state.claim_order = claim_order;
        state.dependents = Some(DependentsIndex::new(plan));
        state.plan = Some(Arc::new(plan.clone()));
        state.ctx = Some(ctx.clone());
        tracing::info!(tasks = plan.len(), "submitted tasks for execution");
        Ok(())
    }

    async fn wait_for_completion(&self, max_executors: usize) -> Result<()> {
        let num_tasks = {
            let state = self.inner.state.lock().expect("task lock poisoned");
            state.plan.as_ref().context("tasks not submitted")?.len()
        };
        let num_workers = max_executors.max(1).min(num_tasks);
        tracing::info!(
            tasks = num_tasks,
            budget = max_executors,
            workers = num_workers,
            "spawning executor workers"
        );

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 1..=num_workers {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self.inner),
                worker_id,
            )));
            tokio::time::sleep(self.inner.config.stagger).await;
        }

        for handle in handles {
            handle.await.context("worker task panicked")?;
        }

        let state = self.inner.state.lock().expect("task lock poisoned");
        tracing::info!(
            completed = state.completed.len(),
            failed = state.terminal_failed.len(),
            skipped = state.skipped.len(),
            "all executor workers finished"
        );
        Ok(())
    }

    async fn get_task_status(&self, task_id: &str) -> TaskStatus {
        let state = self.inner.state.lock().expect("task lock poisoned");
        if state.completed.contains(task_id) {
            TaskStatus::Completed
        } else if state.in_progress.contains(task_id) {
            TaskStatus::InProgress
        } else if state.terminal_failed.contains(task_id) {
            TaskStatus::Failed
        } else if state
            .plan
            .as_ref()
            .is_some_and(|p| p.task(task_id).is_some())
        {
            // Skipped dependents stay pending forever.
            TaskStatus::Pending
        } else {
            TaskStatus::Unknown
        }
    }

    async fn get_results(&self) -> Vec<TaskResult> {
        self.inner
            .results
            .lock()
            .expect("results lock poisoned")
            .clone()
    }

    async fn mark_task_complete(&self, task_id: &str, result: TaskResult) -> Result<()> {
        let task = {
            let state = self.inner.state.lock().expect("task lock poisoned");
            state
                .plan
                .as_ref()
                .context("tasks not submitted")?
                .task(task_id)
                .cloned()
        }
        .with_context(|| format!("unknown task {task_id}"))?;
        complete_task(&self.inner, &task, result);
        Ok(())
    }

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> Result<()> {
        let task = {
            let state = self.inner.state.lock().expect("task lock poisoned");
            state
                .plan
                .as_ref()
                .context("tasks not submitted")?
                .task(task_id)
                .cloned()
        }
        .with_context(|| format!("unknown task {task_id}"))?;
        fail_task(&self.inner, &task, error).await;
        Ok(())
    }

    async fn can_execute_task(&self, task: &Task) -> bool {
        let state = self.inner.state.lock().expect("task lock poisoned");
        state.plan.is_none() || state.deps_completed(&task.id)
    }

    async fn get_completed_tasks(&self) -> BTreeSet<String> {
        let state = self.inner.state.lock().expect("task lock poisoned");
        state.completed.clone()
    }

    async fn get_in_progress_tasks(&self) -> BTreeSet<String> {
        let state = self.inner.state.lock().expect("task lock poisoned");
        state.in_progress.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn backend_info(&self) -> BTreeMap<String, String> {
        let state = self.inner.state.lock().expect("task lock poisoned");
        let mut info = BTreeMap::from([("backend".to_owned(), "threading".to_owned())]);
        if let Some(plan) = &state.plan {
            info.insert("tasks".to_owned(), plan.len().to_string());
        }
        info
    }
}
