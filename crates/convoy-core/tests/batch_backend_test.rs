//! Batch backend tests against a scripted batch service and an in-memory
//! object store.

use std::sync::Arc;
use std::time::Duration;

use convoy_core::backend::ExecutionBackend;
use convoy_core::backend::batch::{BatchBackend, BatchConfig};
use convoy_core::error::OrchestratorError;
use convoy_core::jobs::BatchJobState;
use convoy_core::model::{ResultStatus, RunContext, TaskResult, TaskStatus};
use convoy_core::retry::RetryPolicy;

use convoy_test_utils::{MemoryObjectStore, ScriptedBatchService, plan};

fn fast_batch_config(max_retries: u32) -> BatchConfig {
    BatchConfig {
        job_queue: "convoy-queue".to_owned(),
        job_definition: "convoy-job".to_owned(),
        poll_interval: Duration::from_millis(10),
        max_wait: Duration::from_secs(10),
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
        },
        ..BatchConfig::default()
    }
}

fn run_ctx(dir: &tempfile::TempDir) -> RunContext {
    RunContext::new(dir.path().to_path_buf(), "build it".to_owned(), true)
}

fn completed_result(task_id: &str) -> TaskResult {
    TaskResult {
        task_id: task_id.to_owned(),
        task_name: task_id.to_uppercase(),
        worker: None,
        status: ResultStatus::Completed,
        execution_time_secs: 2.0,
        output_files: Vec::new(),
        metrics: None,
        error: None,
    }
}

/// Pretend the worker containers already uploaded their results.
fn seed_store_results(store: &MemoryObjectStore, task_ids: &[&str]) {
    for id in task_ids {
        store.insert(
            &format!("results/{id}.json"),
            serde_json::to_vec_pretty(&completed_result(id)).unwrap(),
        );
    }
}

fn make_backend(
    ctx: &RunContext,
    service: Arc<ScriptedBatchService>,
    store: Arc<MemoryObjectStore>,
    max_retries: u32,
) -> BatchBackend {
    BatchBackend::new(ctx.clone(), service, store, fast_batch_config(max_retries))
}

#[tokio::test]
async fn diamond_runs_to_completion_with_native_dependencies() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service.clone(), store.clone(), 1);
    let plan = plan(
        &["a", "b", "c", "d"],
        &[("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])],
        4,
    );

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    seed_store_results(&store, &["a", "b", "c", "d"]);
    backend.wait_for_completion(4).await.unwrap();
    backend.cleanup().await.unwrap();

    // Task definitions were uploaded before any submission.
    for id in ["a", "b", "c", "d"] {
        assert!(store.object(&format!("tasks/{id}.json")).is_some());
        assert_eq!(backend.get_task_status(id).await, TaskStatus::Completed);
    }

    // Dependency edges became native depends_on references, one entry per
    // predecessor.
    let records = service.submission_records();
    assert_eq!(records.len(), 4);
    let (a_job, a_request) = &records[0];
    assert_eq!(a_request.job_name, "co_a");
    assert!(a_request.depends_on.is_empty());
    assert_eq!(records[1].1.depends_on, vec![a_job.clone()]);
    assert_eq!(records[2].1.depends_on, vec![a_job.clone()]);
    assert_eq!(records[3].1.depends_on.len(), 2);

    // Worker containers receive their environment through overrides.
    assert!(
        a_request
            .environment
            .iter()
            .any(|(k, v)| k == "CONVOY_TASK_ID" && v == "a")
    );
    assert!(
        a_request
            .environment
            .iter()
            .any(|(k, v)| k == "CONVOY_USE_REAL_EXECUTORS" && v == "true")
    );

    // State snapshots are mirrored to the store.
    assert!(store.object("state/marker.json").is_some());
    assert!(store.object("state/tasks.json").is_some());
    assert!(store.object("state/jobs.json").is_some());

    let results = backend.get_results().await;
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.status == ResultStatus::Completed));
}

#[tokio::test]
async fn unavailable_service_fails_initialization() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    service.set_unavailable();
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service, store, 1);

    let err = backend.initialize().await.unwrap_err();
    let orchestrator_err = err
        .downcast_ref::<OrchestratorError>()
        .expect("should be an OrchestratorError");
    assert!(matches!(
        orchestrator_err,
        OrchestratorError::BackendUnavailable { .. }
    ));
}

#[tokio::test]
async fn failed_job_retries_and_drops_satisfied_dependencies() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    // b's first job fails, the resubmission succeeds.
    service.script_outcomes(
        "co_b",
        vec![(BatchJobState::Failed, Some("container OOM".to_owned()))],
    );
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service.clone(), store.clone(), 2);
    let plan = plan(&["a", "b"], &[("b", &["a"])], 2);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    seed_store_results(&store, &["a", "b"]);
    backend.wait_for_completion(2).await.unwrap();

    assert_eq!(backend.get_task_status("a").await, TaskStatus::Completed);
    assert_eq!(backend.get_task_status("b").await, TaskStatus::Completed);

    let records = service.submission_records();
    let b_submissions: Vec<_> = records
        .iter()
        .filter(|(_, r)| r.job_name == "co_b")
        .collect();
    assert_eq!(b_submissions.len(), 2, "b must be submitted twice");
    assert_eq!(
        b_submissions[0].1.depends_on.len(),
        1,
        "first submission carries the dependency"
    );
    assert!(
        b_submissions[1].1.depends_on.is_empty(),
        "resubmission must drop the already-satisfied dependency"
    );
}

#[tokio::test]
async fn missing_result_object_fails_the_task() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service.clone(), store, 1);
    let plan = plan(&["a"], &[], 1);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    // The job succeeds but never uploads results/a.json.
    backend.wait_for_completion(1).await.unwrap();

    assert_eq!(service.submissions().len(), 2, "one retry expected");
    assert_eq!(backend.get_task_status("a").await, TaskStatus::Failed);

    let results = backend.get_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Failed);
    assert_eq!(results[0].error.as_deref(), Some("missing result"));
}

#[tokio::test]
async fn job_level_failure_skips_dependents() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    service.script_outcomes(
        "co_a",
        vec![(BatchJobState::Failed, Some("bad image".to_owned()))],
    );
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service, store, 0);
    let plan = plan(&["a", "b"], &[("b", &["a"])], 2);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(2).await.unwrap();

    assert_eq!(backend.get_task_status("a").await, TaskStatus::Failed);
    assert_eq!(backend.skipped_tasks().await, vec!["b".to_owned()]);

    let results = backend.get_results().await;
    let a_result = results.iter().find(|r| r.task_id == "a").unwrap();
    assert_eq!(a_result.error.as_deref(), Some("bad image"));
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service, store.clone(), 1);
    let plan = plan(&["a"], &[], 1);

    backend.initialize().await.unwrap();
    // Two transient blips: the bounded-backoff retry absorbs them.
    store.inject_failures(2);
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    assert!(store.object("tasks/a.json").is_some());
}

#[tokio::test]
async fn local_mirror_matches_store_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let service = Arc::new(ScriptedBatchService::new());
    let store = Arc::new(MemoryObjectStore::new());
    let backend = make_backend(&ctx, service, store.clone(), 1);
    let plan = plan(&["a"], &[], 1);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    seed_store_results(&store, &["a"]);
    backend.wait_for_completion(1).await.unwrap();

    // The local mirror under .batch_state has the same canonical files.
    let state = backend.state_dir();
    assert!(state.marker_path().exists());
    assert!(state.task_definition_path("a").exists());
    let tasks = state.read_tasks().unwrap();
    assert_eq!(tasks.completed, vec!["a".to_owned()]);
    let jobs = state.read_jobs().unwrap();
    assert_eq!(jobs.run_id, ctx.run_id);
    assert!(jobs.jobs.contains_key("a"));

    // The collected result file round-trips bytewise through the store.
    let local = std::fs::read(state.result_path("a")).unwrap();
    let remote = store.object("results/a.json").unwrap();
    let local_parsed: TaskResult = serde_json::from_slice(&local).unwrap();
    let remote_parsed: TaskResult = serde_json::from_slice(&remote).unwrap();
    assert_eq!(local_parsed, remote_parsed);
}
