//! Run driver: validates the plan, hands it to the selected backend, waits
//! under the run-wide ceiling, and aggregates results into a summary.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::backend::ExecutionBackend;
use crate::error::OrchestratorError;
use crate::model::{Plan, RunContext, RunSummary, TaskResult};
use crate::plan;

/// Scheduler-level knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Run-wide wall-clock ceiling. Non-terminal tasks at expiry are
    /// reported as failed with `error = "timeout"`.
    pub run_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Drive a plan to completion over the given backend.
///
/// Blocks until every task is terminal, the ceiling is hit, or the run is
/// cancelled. Idempotent per invocation; not safe to call concurrently on
/// overlapping plans.
pub async fn run_plan(
    plan: &Plan,
    ctx: &RunContext,
    backend: Arc<dyn ExecutionBackend>,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    // An invalid plan is rejected before the backend sees anything.
    plan::validate(plan).map_err(OrchestratorError::PlanInvalid)?;

    tracing::info!(
        run_id = %ctx.run_id,
        backend = backend.name(),
        tasks = plan.len(),
        budget = plan.executor_budget,
        requirements = %ctx.requirements,
        "orchestrator starting"
    );
    let started = std::time::Instant::now();

    tokio::fs::create_dir_all(&ctx.output_dir)
        .await
        .with_context(|| format!("failed to create {}", ctx.output_dir.display()))?;
    write_json(&ctx.output_dir.join("execution_plan.json"), plan).await?;

    backend.initialize().await?;
    for (key, value) in backend.backend_info() {
        tracing::info!(key = %key, value = %value, "backend info");
    }

    backend.submit_tasks(plan, ctx).await?;

    // Wait for the backend, bounded by the ceiling and the cancel token.
    let timed_out = tokio::select! {
        outcome = backend.wait_for_completion(plan.executor_budget) => {
            outcome?;
            false
        }
        _ = tokio::time::sleep(config.run_timeout) => {
            tracing::warn!(ceiling = ?config.run_timeout, "run-wide wall-clock ceiling reached");
            true
        }
        _ = cancel.cancelled() => {
            // Hard stop: partial state stays in place for inspection.
            tracing::warn!(run_id = %ctx.run_id, "run interrupted");
            return Err(OrchestratorError::Interrupted.into());
        }
    };

    let mut results = backend.get_results().await;
    let completed = backend.get_completed_tasks().await;

    let skipped = if timed_out {
        // Every task without a terminal outcome is failed with "timeout".
        let have_results: BTreeSet<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        let missing: Vec<TaskResult> = plan
            .tasks
            .iter()
            .filter(|t| !completed.contains(&t.id) && !have_results.contains(t.id.as_str()))
            .map(|t| TaskResult::failure(&t.id, &t.name, "timeout"))
            .collect();
        results.extend(missing);
        Vec::new()
    } else {
        // Dependents of terminally failed tasks never ran and have no
        // result; they surface as skipped.
        let have_results: BTreeSet<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        plan.tasks
            .iter()
            .filter(|t| !completed.contains(&t.id) && !have_results.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    };

    let summary = RunSummary::from_results(
        &ctx.run_id,
        backend.name(),
        plan.len(),
        skipped,
        results,
        started.elapsed().as_secs_f64(),
    );

    write_json(&ctx.output_dir.join("execution_summary.json"), &summary).await?;
    backend.cleanup().await?;

    tracing::info!(
        run_id = %ctx.run_id,
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped.len(),
        success_rate = %summary.success_rate,
        total_secs = %format!("{:.2}", summary.total_execution_secs),
        "orchestrator finished"
    );
    Ok(summary)
}

async fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize")?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
