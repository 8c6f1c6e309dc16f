//! End-to-end tests for the scheduler over the in-memory backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use convoy_core::backend::ExecutionBackend;
use convoy_core::backend::threading::{ThreadingBackend, ThreadingConfig};
use convoy_core::error::OrchestratorError;
use convoy_core::model::{ResultStatus, RunContext, TaskStatus};
use convoy_core::plan::PlanError;
use convoy_core::retry::RetryPolicy;
use convoy_core::scheduler::{SchedulerConfig, run_plan};

use convoy_test_utils::{Phase, ScriptedWorker, chain, independent, plan, task_with_priority};

// ===========================================================================
// Harness
// ===========================================================================

fn fast_config(retry: RetryPolicy) -> ThreadingConfig {
    ThreadingConfig {
        idle_recheck: Duration::from_millis(10),
        stagger: Duration::from_millis(1),
        retry,
    }
}

fn fast_retry(max_retries: u32, base_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(base_ms),
        exponential_backoff: true,
        backoff_multiplier: 2.0,
    }
}

fn run_ctx(dir: &tempfile::TempDir) -> RunContext {
    RunContext::new(dir.path().to_path_buf(), "test requirements".to_owned(), false)
}

async fn run(
    plan: &convoy_core::model::Plan,
    worker: Arc<ScriptedWorker>,
    retry: RetryPolicy,
) -> (
    anyhow::Result<convoy_core::model::RunSummary>,
    Arc<ThreadingBackend>,
    tempfile::TempDir,
) {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let backend = Arc::new(ThreadingBackend::new(worker, fast_config(retry)));
    let dyn_backend: Arc<dyn ExecutionBackend> = backend.clone();
    let summary = run_plan(
        plan,
        &ctx,
        dyn_backend,
        &SchedulerConfig::default(),
        CancellationToken::new(),
    )
    .await;
    (summary, backend, dir)
}

// ===========================================================================
// Scenario 1: linear chain
// ===========================================================================

#[tokio::test]
async fn linear_chain_completes_in_order() {
    let plan = chain(&["a", "b", "c"], 4);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(10)));
    let started = Instant::now();

    let (summary, _, _dir) = run(&plan, worker.clone(), fast_retry(3, 10)).await;
    let summary = summary.unwrap();

    assert!(summary.success);
    assert_eq!(summary.completed, 3);
    assert_eq!(worker.completion_order(), vec!["a", "b", "c"]);
    assert_eq!(worker.peak_in_progress(), 1, "a chain can never overlap");
    assert!(
        started.elapsed() >= Duration::from_millis(30),
        "three 10ms tasks must take at least 30ms"
    );
}

// ===========================================================================
// Scenario 2: fan-out / fan-in
// ===========================================================================

#[tokio::test]
async fn fan_out_overlaps_and_fan_in_waits() {
    // a -> {b, c, d} -> e
    let plan = plan(
        &["a", "b", "c", "d", "e"],
        &[
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["a"]),
            ("e", &["b", "c", "d"]),
        ],
        3,
    );
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(150)));

    let (summary, _, _dir) = run(&plan, worker.clone(), fast_retry(3, 10)).await;
    let summary = summary.unwrap();

    assert!(summary.success);
    assert_eq!(worker.peak_in_progress(), 3, "b, c, d should overlap");

    // e starts strictly after each of b, c, d completes.
    let e_claimed = worker.instant_of("e", Phase::Claimed).unwrap();
    for dep in ["b", "c", "d"] {
        let done = worker.instant_of(dep, Phase::Completed).unwrap();
        assert!(done <= e_claimed, "{dep} must complete before e is claimed");
    }
}

// ===========================================================================
// Scenario 3: retry then succeed
// ===========================================================================

#[tokio::test]
async fn retry_then_succeed_records_attempts_and_backoff() {
    let plan = independent(1, 2);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)).fail_times("t1", 2));
    let started = Instant::now();

    let (summary, backend, _dir) = run(&plan, worker.clone(), fast_retry(3, 10)).await;
    let summary = summary.unwrap();

    assert!(summary.success);
    assert_eq!(summary.results[0].status, ResultStatus::Completed);
    assert_eq!(backend.attempts_used().get("t1"), Some(&2));
    // Backoff: 10ms then 20ms before the third (successful) attempt.
    assert!(
        started.elapsed() >= Duration::from_millis(30),
        "two backoff sleeps must cost at least 30ms"
    );
}

// ===========================================================================
// Scenario 4: retry exhausted, dependent skipped
// ===========================================================================

#[tokio::test]
async fn retry_exhausted_fails_task_and_skips_dependent() {
    let plan = plan(&["a", "b"], &[("b", &["a"])], 2);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)).fail_times("a", 100));

    let (summary, backend, _dir) = run(&plan, worker.clone(), fast_retry(1, 5)).await;
    let summary = summary.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, vec!["b".to_owned()]);

    // max_retries = 1 means exactly two attempts in total.
    let failed_attempts = worker
        .events()
        .iter()
        .filter(|(id, phase, _)| id == "a" && *phase == Phase::Failed)
        .count();
    assert_eq!(failed_attempts, 2);
    assert_eq!(backend.attempts_used().get("a"), Some(&1));

    // b was never claimed and stays pending.
    assert!(worker.instant_of("b", Phase::Claimed).is_none());
    assert_eq!(backend.get_task_status("b").await, TaskStatus::Pending);
    assert_eq!(backend.get_task_status("a").await, TaskStatus::Failed);

    let failure = summary
        .results
        .iter()
        .find(|r| r.task_id == "a")
        .expect("failure result for a");
    assert_eq!(failure.status, ResultStatus::Failed);
    assert!(failure.error.as_deref().unwrap().contains("scripted failure"));
}

// ===========================================================================
// Scenario 5: budget cap
// ===========================================================================

#[tokio::test]
async fn budget_caps_concurrency() {
    let plan = independent(10, 3);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(100)));
    let started = Instant::now();

    let (summary, _, _dir) = run(&plan, worker.clone(), fast_retry(3, 10)).await;
    let summary = summary.unwrap();

    assert!(summary.success);
    assert_eq!(summary.completed, 10);
    assert_eq!(worker.peak_in_progress(), 3, "peak must equal the budget");
    // 10 tasks at 100ms over 3 workers: at least 4 waves.
    assert!(started.elapsed() >= Duration::from_millis(400));
}

// ===========================================================================
// Scenario 6: cycle rejection
// ===========================================================================

#[tokio::test]
async fn cyclic_plan_is_rejected_before_any_claim() {
    let plan = plan(&["a", "b"], &[("a", &["b"]), ("b", &["a"])], 2);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)));

    let (outcome, _, _dir) = run(&plan, worker.clone(), fast_retry(3, 10)).await;
    let err = outcome.unwrap_err();

    let orchestrator_err = err
        .downcast_ref::<OrchestratorError>()
        .expect("should be an OrchestratorError");
    assert!(matches!(
        orchestrator_err,
        OrchestratorError::PlanInvalid(PlanError::CyclicDependency(_))
    ));
    assert!(
        worker.events().is_empty(),
        "no task may be claimed for an invalid plan"
    );
}

// ===========================================================================
// Ordering properties
// ===========================================================================

#[tokio::test]
async fn dependency_completion_happens_before_dependent_claim() {
    let plan = chain(&["a", "b", "c", "d"], 4);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(10)));

    let (summary, _, _dir) = run(&plan, worker.clone(), fast_retry(3, 10)).await;
    assert!(summary.unwrap().success);

    for (dep, dependent) in [("a", "b"), ("b", "c"), ("c", "d")] {
        let done = worker.instant_of(dep, Phase::Completed).unwrap();
        let claimed = worker.instant_of(dependent, Phase::Claimed).unwrap();
        assert!(done <= claimed, "{dep} must complete before {dependent}");
    }
}

#[tokio::test]
async fn single_worker_completes_in_tie_break_order() {
    // Priorities break the tie, insertion order breaks equal priorities.
    let mut p = independent(0, 1);
    p.tasks = vec![
        task_with_priority("late", 5),
        task_with_priority("first", 1),
        task_with_priority("mid_a", 3),
        task_with_priority("mid_b", 3),
    ];
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)));

    let (summary, _, _dir) = run(&p, worker.clone(), fast_retry(3, 10)).await;
    assert!(summary.unwrap().success);
    assert_eq!(
        worker.completion_order(),
        vec!["first", "mid_a", "mid_b", "late"]
    );
}

// ===========================================================================
// Run-level behavior
// ===========================================================================

#[tokio::test]
async fn timeout_fails_remaining_tasks() {
    let plan = independent(2, 1);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_secs(30)));

    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let backend = Arc::new(ThreadingBackend::new(
        worker,
        fast_config(fast_retry(0, 5)),
    ));
    let dyn_backend: Arc<dyn ExecutionBackend> = backend.clone();
    let config = SchedulerConfig {
        run_timeout: Duration::from_millis(100),
    };

    let summary = run_plan(&plan, &ctx, dyn_backend, &config, CancellationToken::new())
        .await
        .unwrap();

    assert!(!summary.success);
    assert_eq!(summary.results.len(), 2);
    for result in &summary.results {
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }
}

#[tokio::test]
async fn cancellation_aborts_the_run() {
    let plan = independent(2, 1);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_secs(30)));

    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let backend = Arc::new(ThreadingBackend::new(
        worker,
        fast_config(fast_retry(0, 5)),
    ));
    let dyn_backend: Arc<dyn ExecutionBackend> = backend.clone();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = run_plan(
        &plan,
        &ctx,
        dyn_backend,
        &SchedulerConfig::default(),
        cancel,
    )
    .await
    .unwrap_err();
    let orchestrator_err = err
        .downcast_ref::<OrchestratorError>()
        .expect("should be an OrchestratorError");
    assert!(matches!(orchestrator_err, OrchestratorError::Interrupted));
}

#[tokio::test]
async fn summary_and_plan_are_written_to_output_dir() {
    let plan = independent(2, 2);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)));

    let (summary, _, dir) = run(&plan, worker, fast_retry(3, 10)).await;
    let summary = summary.unwrap();
    assert!(summary.success);
    assert_eq!(summary.success_rate, "100.0%");

    let summary_path = dir.path().join("execution_summary.json");
    let plan_path = dir.path().join("execution_plan.json");
    assert!(summary_path.exists());
    assert!(plan_path.exists());

    // The summary file round-trips.
    let bytes = std::fs::read(summary_path).unwrap();
    let on_disk: convoy_core::model::RunSummary = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(on_disk.completed, 2);
    assert_eq!(on_disk.run_id, summary.run_id);
}

#[tokio::test]
async fn mixed_failure_degrades_but_does_not_abort() {
    // c depends on the failing a; b is independent and still completes.
    let plan = plan(&["a", "b", "c"], &[("c", &["a"])], 2);
    let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(5)).fail_times("a", 100));

    let (summary, _, _dir) = run(&plan, worker, fast_retry(0, 5)).await;
    let summary = summary.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, vec!["c".to_owned()]);
    assert_eq!(summary.success_rate, "33.3%");
}
