//! Container backend tests against a mock container runtime.

use std::sync::Arc;
use std::time::Duration;

use convoy_core::backend::ExecutionBackend;
use convoy_core::backend::container::{ContainerBackend, ContainerConfig};
use convoy_core::error::OrchestratorError;
use convoy_core::model::{ResultStatus, RunContext, TaskStatus};
use convoy_core::retry::RetryPolicy;

use convoy_test_utils::{MockContainerRuntime, chain, independent, plan};

fn fast_container_config(max_retries: u32) -> ContainerConfig {
    ContainerConfig {
        poll_interval: Duration::from_millis(5),
        dependency_recheck: Duration::from_millis(5),
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
        },
        ..ContainerConfig::default()
    }
}

fn run_ctx(dir: &tempfile::TempDir) -> RunContext {
    RunContext::new(dir.path().to_path_buf(), "build it".to_owned(), false)
}

fn executor_of(spec: &convoy_core::jobs::container::ContainerSpec) -> String {
    spec.env
        .iter()
        .find(|(k, _)| k == "CONVOY_EXECUTOR_ID")
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

fn task_of(spec: &convoy_core::jobs::container::ContainerSpec) -> String {
    spec.env
        .iter()
        .find(|(k, _)| k == "CONVOY_TASK_ID")
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn tasks_are_round_robin_assigned_to_workers() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let runtime = Arc::new(MockContainerRuntime::succeeding());
    let backend = ContainerBackend::new(runtime.clone(), fast_container_config(1));
    let plan = independent(5, 2);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(2).await.unwrap();

    for i in 1..=5 {
        let id = format!("t{i}");
        assert_eq!(backend.get_task_status(&id).await, TaskStatus::Completed);
    }

    // Round-robin over two workers: t1, t3, t5 on worker 1; t2, t4 on 2.
    let specs = runtime.launched_specs();
    assert_eq!(specs.len(), 5);
    for spec in &specs {
        let expected_worker = match task_of(spec).as_str() {
            "t1" | "t3" | "t5" => "1",
            _ => "2",
        };
        assert_eq!(executor_of(spec), expected_worker, "task {}", task_of(spec));
    }
}

#[tokio::test]
async fn dependencies_gate_container_launches() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let runtime = Arc::new(MockContainerRuntime::succeeding());
    let backend = ContainerBackend::new(runtime.clone(), fast_container_config(1));
    // a and b land on different workers; b must still wait for a.
    let plan = chain(&["a", "b"], 2);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(2).await.unwrap();

    let order: Vec<String> = runtime.launched_specs().iter().map(task_of).collect();
    assert_eq!(order, vec!["a", "b"], "b's container must start after a");
    assert_eq!(backend.get_task_status("b").await, TaskStatus::Completed);
}

#[tokio::test]
async fn task_file_and_result_flow_through_the_mounted_volume() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let runtime = Arc::new(MockContainerRuntime::succeeding());
    let backend = ContainerBackend::new(runtime.clone(), fast_container_config(1));
    let plan = independent(1, 1);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(1).await.unwrap();

    // The task brief was written into the mounted directory.
    let task_dir = dir.path().join("executor_1").join("t1");
    assert!(task_dir.join("task.json").exists());
    assert!(task_dir.join("result.json").exists());

    let results = backend.get_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Completed);
}

#[tokio::test]
async fn missing_result_in_volume_fails_and_skips_dependents() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    // Containers exit cleanly but write nothing.
    let runtime = Arc::new(MockContainerRuntime::with_worker(|_| 0));
    let backend = ContainerBackend::new(runtime.clone(), fast_container_config(1));
    let plan = plan(&["a", "b"], &[("b", &["a"])], 1);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(1).await.unwrap();

    assert_eq!(backend.get_task_status("a").await, TaskStatus::Failed);
    assert_eq!(backend.skipped_tasks(), vec!["b".to_owned()]);

    // Initial attempt plus one retry.
    let a_launches = runtime
        .launched_specs()
        .iter()
        .filter(|s| task_of(s) == "a")
        .count();
    assert_eq!(a_launches, 2);

    let results = backend.get_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error.as_deref(), Some("missing result"));
}

#[tokio::test]
async fn nonzero_exit_is_a_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let runtime = Arc::new(MockContainerRuntime::with_worker(|_| 137));
    let backend = ContainerBackend::new(runtime, fast_container_config(0));
    let plan = independent(1, 1);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(1).await.unwrap();

    let results = backend.get_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Failed);
    assert!(
        results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("exited with code 137")
    );
}

#[tokio::test]
async fn missing_image_fails_initialization() {
    let runtime = Arc::new(MockContainerRuntime::succeeding().without_image());
    let backend = ContainerBackend::new(runtime, fast_container_config(1));

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
async fn cleanup_removes_launched_containers() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = run_ctx(&dir);
    let runtime = Arc::new(MockContainerRuntime::succeeding());
    let backend = ContainerBackend::new(runtime.clone(), fast_container_config(1));
    let plan = independent(2, 2);

    backend.initialize().await.unwrap();
    backend.submit_tasks(&plan, &ctx).await.unwrap();
    backend.wait_for_completion(2).await.unwrap();
    backend.cleanup().await.unwrap();

    assert_eq!(runtime.removed().len(), 2);
}
