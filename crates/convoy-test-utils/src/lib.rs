//! Shared test utilities for convoy integration tests.
//!
//! Plan builders, a scripted in-process worker body that records claim and
//! completion instants, and mock implementations of the external service
//! seams (job scheduler, batch service, object store, container runtime).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;

use convoy_core::exec::{WorkerBody, WorkerContext};
use convoy_core::jobs::container::{ContainerRuntime, ContainerSpec, ContainerState};
use convoy_core::jobs::{
    BatchJobState, BatchJobStatus, BatchService, BatchSubmitRequest, JobId, JobRequest,
    JobScheduler, JobState, ObjectStore,
};
use convoy_core::model::{Plan, ResultStatus, Task, TaskResult};

// ---------------------------------------------------------------------------
// Plan builders
// ---------------------------------------------------------------------------

/// Build a task with default priority.
pub fn task(id: &str) -> Task {
    task_with_priority(id, 3)
}

pub fn task_with_priority(id: &str, priority: u8) -> Task {
    Task {
        id: id.to_owned(),
        name: id.to_uppercase(),
        description: format!("do {id}"),
        priority,
        estimated_duration: None,
        payload: String::new(),
    }
}

/// Build a plan from task ids and (task, dependencies) pairs.
pub fn plan(ids: &[&str], deps: &[(&str, &[&str])], budget: usize) -> Plan {
    let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (id, ds) in deps {
        dependencies.insert(
            (*id).to_owned(),
            ds.iter().map(|d| (*d).to_owned()).collect(),
        );
    }
    Plan {
        tasks: ids.iter().map(|id| task(id)).collect(),
        dependencies,
        executor_budget: budget,
    }
}

/// Linear chain: each task depends on the previous one.
pub fn chain(ids: &[&str], budget: usize) -> Plan {
    let deps: Vec<(String, Vec<String>)> = ids
        .windows(2)
        .map(|pair| (pair[1].to_owned(), vec![pair[0].to_owned()]))
        .collect();
    let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (id, ds) in deps {
        dependencies.insert(id, ds.into_iter().collect());
    }
    Plan {
        tasks: ids.iter().map(|id| task(id)).collect(),
        dependencies,
        executor_budget: budget,
    }
}

/// `n` independent tasks named `t1..tn`.
pub fn independent(n: usize, budget: usize) -> Plan {
    let ids: Vec<String> = (1..=n).map(|i| format!("t{i}")).collect();
    Plan {
        tasks: ids.iter().map(|id| task(id)).collect(),
        dependencies: BTreeMap::new(),
        executor_budget: budget,
    }
}

// ---------------------------------------------------------------------------
// Scripted worker body
// ---------------------------------------------------------------------------

/// What a [`ScriptedWorker`] observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Claimed,
    Completed,
    Failed,
}

/// Worker body with per-task failure scripts and full observability.
///
/// Records (task id, phase, instant) events, tracks the concurrent
/// execution peak, and fails each task the scripted number of times before
/// letting it succeed.
pub struct ScriptedWorker {
    delay: Duration,
    fail_budget: Mutex<HashMap<String, u32>>,
    events: Mutex<Vec<(String, Phase, Instant)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_budget: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Make `task_id` fail its first `times` attempts.
    pub fn fail_times(self, task_id: &str, times: u32) -> Self {
        self.fail_budget
            .lock()
            .unwrap()
            .insert(task_id.to_owned(), times);
        self
    }

    /// Highest number of concurrently executing tasks observed.
    pub fn peak_in_progress(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// All recorded events in order.
    pub fn events(&self) -> Vec<(String, Phase, Instant)> {
        self.events.lock().unwrap().clone()
    }

    /// Task ids in the order they completed successfully.
    pub fn completion_order(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(_, phase, _)| *phase == Phase::Completed)
            .map(|(id, _, _)| id)
            .collect()
    }

    /// Instant of the first event of `phase` for `task_id`.
    pub fn instant_of(&self, task_id: &str, phase: Phase) -> Option<Instant> {
        self.events()
            .into_iter()
            .find(|(id, p, _)| id == task_id && *p == phase)
            .map(|(_, _, at)| at)
    }

    fn record(&self, task_id: &str, phase: Phase) {
        self.events
            .lock()
            .unwrap()
            .push((task_id.to_owned(), phase, Instant::now()));
    }
}

#[async_trait]
impl WorkerBody for ScriptedWorker {
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> Result<TaskResult> {
        self.record(&task.id, Phase::Claimed);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.running.fetch_sub(1, Ordering::SeqCst);

        let should_fail = {
            let mut budget = self.fail_budget.lock().unwrap();
            match budget.get_mut(&task.id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if should_fail {
            self.record(&task.id, Phase::Failed);
            bail!("scripted failure for {}", task.id);
        }

        self.record(&task.id, Phase::Completed);
        Ok(TaskResult {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            worker: Some(format!("executor-{}", ctx.worker_id)),
            status: ResultStatus::Completed,
            execution_time_secs: self.delay.as_secs_f64(),
            output_files: Vec::new(),
            metrics: None,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Mock cluster scheduler
// ---------------------------------------------------------------------------

/// One recorded submission.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub job_id: JobId,
    pub job_name: String,
    pub script: PathBuf,
    pub dependencies: Vec<JobId>,
}

struct MockSchedulerInner {
    next_id: u64,
    submissions: Vec<SubmissionRecord>,
    /// job id -> final state assigned at submission time.
    states: HashMap<JobId, JobState>,
    /// key (matched as substring of job_name) -> queued outcomes, consumed
    /// one per submission.
    outcomes: HashMap<String, VecDeque<JobState>>,
    cancelled: Vec<JobId>,
}

/// Job scheduler mock: every submitted job immediately reaches its
/// scripted final state (default: completed).
pub struct MockJobScheduler {
    inner: Mutex<MockSchedulerInner>,
}

impl Default for MockJobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobScheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockSchedulerInner {
                next_id: 100,
                submissions: Vec::new(),
                states: HashMap::new(),
                outcomes: HashMap::new(),
                cancelled: Vec::new(),
            }),
        }
    }

    /// Script outcomes for jobs whose name contains `key`. Each submission
    /// consumes one entry; further submissions complete.
    pub fn script_outcomes(&self, key: &str, outcomes: Vec<JobState>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .outcomes
            .insert(key.to_owned(), outcomes.into_iter().collect());
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.inner.lock().unwrap().submissions.clone()
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.inner.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl JobScheduler for MockJobScheduler {
    async fn submit(&self, request: &JobRequest) -> Result<JobId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let job_id = inner.next_id.to_string();

        let scripted = inner
            .outcomes
            .iter_mut()
            .find(|(key, _)| request.job_name.contains(key.as_str()))
            .and_then(|(_, queue)| queue.pop_front());
        let state = scripted.unwrap_or(JobState::Completed);

        inner.states.insert(job_id.clone(), state);
        inner.submissions.push(SubmissionRecord {
            job_id: job_id.clone(),
            job_name: request.job_name.clone(),
            script: request.script.clone(),
            dependencies: request.dependencies.clone(),
        });
        Ok(job_id)
    }

    async fn list_active(&self) -> Result<HashSet<JobId>> {
        Ok(HashSet::new())
    }

    async fn describe(&self, job_id: &JobId) -> Result<JobState> {
        let inner = self.inner.lock().unwrap();
        // Model `afterok` holds: a job only reaches its own state once all
        // of its dependency jobs completed; a failed dependency pins it in
        // the queue forever.
        if let Some(record) = inner.submissions.iter().find(|s| &s.job_id == job_id) {
            for dep in &record.dependencies {
                match inner.states.get(dep) {
                    Some(JobState::Completed) => {}
                    _ => return Ok(JobState::Queued),
                }
            }
        }
        Ok(inner
            .states
            .get(job_id)
            .cloned()
            .unwrap_or(JobState::Queued))
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        self.inner.lock().unwrap().cancelled.push(job_id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted batch service
// ---------------------------------------------------------------------------

struct BatchInner {
    next_id: u64,
    submissions: Vec<(JobId, BatchSubmitRequest)>,
    states: HashMap<JobId, (BatchJobState, Option<String>)>,
    outcomes: HashMap<String, VecDeque<(BatchJobState, Option<String>)>>,
    unavailable: bool,
}

/// Batch service mock with the same scripting model as
/// [`MockJobScheduler`]: submissions reach their scripted terminal state
/// immediately (default: succeeded).
pub struct ScriptedBatchService {
    inner: Mutex<BatchInner>,
}

impl Default for ScriptedBatchService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBatchService {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BatchInner {
                next_id: 9000,
                submissions: Vec::new(),
                states: HashMap::new(),
                outcomes: HashMap::new(),
                unavailable: false,
            }),
        }
    }

    /// Make `validate` fail, as when the service is unreachable.
    pub fn set_unavailable(&self) {
        self.inner.lock().unwrap().unavailable = true;
    }

    /// Script outcomes for jobs whose name contains `key`.
    pub fn script_outcomes(&self, key: &str, outcomes: Vec<(BatchJobState, Option<String>)>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .outcomes
            .insert(key.to_owned(), outcomes.into_iter().collect());
    }

    pub fn submissions(&self) -> Vec<BatchSubmitRequest> {
        self.inner
            .lock()
            .unwrap()
            .submissions
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// Submissions together with their assigned job ids.
    pub fn submission_records(&self) -> Vec<(JobId, BatchSubmitRequest)> {
        self.inner.lock().unwrap().submissions.clone()
    }
}

#[async_trait]
impl BatchService for ScriptedBatchService {
    async fn validate(&self, job_queue: &str, _job_definition: &str) -> Result<()> {
        if self.inner.lock().unwrap().unavailable {
            bail!("job queue {job_queue:?} not found");
        }
        Ok(())
    }

    async fn submit(&self, request: &BatchSubmitRequest) -> Result<JobId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let job_id = format!("batch-{}", inner.next_id);

        let scripted = inner
            .outcomes
            .iter_mut()
            .find(|(key, _)| request.job_name.contains(key.as_str()))
            .and_then(|(_, queue)| queue.pop_front());
        let state = scripted.unwrap_or((BatchJobState::Succeeded, None));

        inner.states.insert(job_id.clone(), state);
        inner.submissions.push((job_id.clone(), request.clone()));
        Ok(job_id)
    }

    async fn describe(&self, job_ids: &[JobId]) -> Result<Vec<BatchJobStatus>> {
        let inner = self.inner.lock().unwrap();
        Ok(job_ids
            .iter()
            .filter_map(|job_id| {
                // A job whose dependency has not succeeded stays pending.
                if let Some((_, request)) =
                    inner.submissions.iter().find(|(id, _)| id == job_id)
                {
                    for dep in &request.depends_on {
                        match inner.states.get(dep) {
                            Some((BatchJobState::Succeeded, _)) => {}
                            _ => {
                                return Some(BatchJobStatus {
                                    job_id: job_id.clone(),
                                    state: BatchJobState::Pending,
                                    reason: None,
                                });
                            }
                        }
                    }
                }
                inner.states.get(job_id).map(|(state, reason)| BatchJobStatus {
                    job_id: job_id.clone(),
                    state: *state,
                    reason: reason.clone(),
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory object store
// ---------------------------------------------------------------------------

/// Object store held entirely in memory.
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Remaining operations that should fail (transient-failure injection).
    failures: AtomicU32,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` operations fail.
    pub fn inject_failures(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_owned(), bytes);
    }

    fn check_failure(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            bail!("injected transient failure");
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.check_failure()?;
        self.insert(key, bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.check_failure()?;
        self.object(key)
            .ok_or_else(|| anyhow::anyhow!("no such object: {key}"))
    }

    async fn sync_up(&self, local_dir: &Path, prefix: &str) -> Result<()> {
        self.check_failure()?;
        let mut stack = vec![local_dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(local_dir) {
                    let key = format!("{prefix}/{}", rel.display());
                    let bytes = std::fs::read(&path)?;
                    self.insert(&key, bytes);
                }
            }
        }
        Ok(())
    }

    async fn sync_down(&self, prefix: &str, local_dir: &Path) -> Result<()> {
        self.check_failure()?;
        let objects = self.objects.lock().unwrap().clone();
        let prefix_slash = format!("{prefix}/");
        for (key, bytes) in objects {
            if let Some(rel) = key.strip_prefix(&prefix_slash) {
                let dest = local_dir.join(rel);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(dest, bytes)?;
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_failure()?;
        let prefix_slash = format!("{prefix}/");
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix_slash))
            .collect())
    }

    fn location(&self) -> String {
        "mem://test".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Mock container runtime
// ---------------------------------------------------------------------------

type ContainerWorker = dyn Fn(&ContainerSpec) -> i32 + Send + Sync;

struct ContainerInner {
    next_id: u64,
    specs: Vec<ContainerSpec>,
    exit_codes: HashMap<String, i32>,
    removed: Vec<String>,
}

/// Container runtime mock.
///
/// `run` invokes a synchronous worker closure that plays the part of the
/// container body (typically writing `result.json` into the mounted
/// volume) and returns the exit code.
pub struct MockContainerRuntime {
    inner: Mutex<ContainerInner>,
    worker: Box<ContainerWorker>,
    image_present: bool,
}

impl MockContainerRuntime {
    /// Runtime whose containers run `worker` and exit with its return
    /// value.
    pub fn with_worker(worker: impl Fn(&ContainerSpec) -> i32 + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(ContainerInner {
                next_id: 1,
                specs: Vec::new(),
                exit_codes: HashMap::new(),
                removed: Vec::new(),
            }),
            worker: Box::new(worker),
            image_present: true,
        }
    }

    /// Runtime whose containers write a completed result and exit 0.
    pub fn succeeding() -> Self {
        Self::with_worker(|spec| {
            let task_id = spec
                .env
                .iter()
                .find(|(k, _)| k == "CONVOY_TASK_ID")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let result = TaskResult {
                task_id: task_id.clone(),
                task_name: task_id.to_uppercase(),
                worker: None,
                status: ResultStatus::Completed,
                execution_time_secs: 0.01,
                output_files: Vec::new(),
                metrics: None,
                error: None,
            };
            if let Some((host_dir, _)) = spec.volumes.first() {
                let bytes = serde_json::to_vec_pretty(&result).unwrap();
                let _ = std::fs::write(host_dir.join("result.json"), bytes);
            }
            0
        })
    }

    /// Pretend the configured image is missing.
    pub fn without_image(mut self) -> Self {
        self.image_present = false;
        self
    }

    pub fn launched_specs(&self) -> Vec<ContainerSpec> {
        self.inner.lock().unwrap().specs.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(self.image_present)
    }

    async fn ensure_network(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let exit_code = (self.worker)(spec);
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let container_id = format!("c{}", inner.next_id);
        inner.specs.push(spec.clone());
        inner.exit_codes.insert(container_id.clone(), exit_code);
        Ok(container_id)
    }

    async fn status(&self, container_id: &str) -> Result<ContainerState> {
        let inner = self.inner.lock().unwrap();
        Ok(match inner.exit_codes.get(container_id) {
            Some(code) => ContainerState::Exited(*code),
            None => ContainerState::Gone,
        })
    }

    async fn tail_logs(&self, _container_id: &str, _lines: usize) -> Result<String> {
        Ok(String::new())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .removed
            .push(container_id.to_owned());
        Ok(())
    }
}
