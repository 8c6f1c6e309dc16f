//! Seams to the external execution services.
//!
//! Each distributed backend talks to its outside world through one of these
//! object-safe traits: an HPC job scheduler, a managed batch service, an
//! object store, or a local container runtime. The concrete implementations
//! shell out to the respective CLIs; tests substitute mocks.

pub mod aws;
pub mod container;
pub mod slurm;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// Opaque external job identifier.
pub type JobId = String;

// ---------------------------------------------------------------------------
// HPC job scheduler (cluster variant)
// ---------------------------------------------------------------------------

/// Resource request attached to a cluster job submission.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub partition: String,
    pub time_limit: String,
    pub memory: String,
    pub cpus_per_task: u32,
    pub gpus_per_task: u32,
    /// Partition to use instead of `partition` when GPUs are requested.
    pub gpu_partition: Option<String>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            partition: "default".to_owned(),
            time_limit: "01:00:00".to_owned(),
            memory: "4G".to_owned(),
            cpus_per_task: 1,
            gpus_per_task: 0,
            gpu_partition: None,
        }
    }
}

impl ResourceSpec {
    /// Scheduler flags for this resource request.
    pub fn sbatch_args(&self) -> Vec<String> {
        let partition = if self.gpus_per_task > 0 {
            self.gpu_partition.as_deref().unwrap_or(&self.partition)
        } else {
            &self.partition
        };
        let mut args = vec![
            format!("--partition={partition}"),
            format!("--time={}", self.time_limit),
            format!("--mem={}", self.memory),
            format!("--cpus-per-task={}", self.cpus_per_task),
        ];
        if self.gpus_per_task > 0 {
            args.push(format!("--gres=gpu:{}", self.gpus_per_task));
        }
        args
    }
}

/// One job submission to the cluster scheduler.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_name: String,
    pub script: PathBuf,
    /// Job ids that must finish successfully before this job starts.
    pub dependencies: Vec<JobId>,
    pub resources: ResourceSpec,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Native state of a cluster job, mapped from the scheduler's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed(String),
}

/// The external cluster job scheduler.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit a job script; returns the scheduler's job id.
    async fn submit(&self, request: &JobRequest) -> Result<JobId>;

    /// Ids of jobs currently queued or running for this user.
    async fn list_active(&self) -> Result<HashSet<JobId>>;

    /// Current state of one job.
    async fn describe(&self, job_id: &JobId) -> Result<JobState>;

    /// Cancel a job. Optional; the default implementation refuses.
    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        bail!("job cancellation not supported (job {job_id})")
    }
}

// ---------------------------------------------------------------------------
// Managed batch service (cloud variant)
// ---------------------------------------------------------------------------

/// One job submission to the managed batch service.
#[derive(Debug, Clone)]
pub struct BatchSubmitRequest {
    pub job_name: String,
    pub job_queue: String,
    pub job_definition: String,
    /// Predecessor job ids; the service starts this job only after all of
    /// them finish.
    pub depends_on: Vec<JobId>,
    pub vcpus: u32,
    pub memory_mb: u32,
    /// Attempt duration ceiling in seconds; 0 disables the ceiling.
    pub timeout_secs: u32,
    pub environment: Vec<(String, String)>,
}

/// Native batch job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchJobState {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl BatchJobState {
    pub fn from_native(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(Self::Submitted),
            "PENDING" => Some(Self::Pending),
            "RUNNABLE" => Some(Self::Runnable),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Status row returned by a batched describe call.
#[derive(Debug, Clone)]
pub struct BatchJobStatus {
    pub job_id: JobId,
    pub state: BatchJobState,
    pub reason: Option<String>,
}

/// The managed batch service.
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Validate that the configured queue and job definition exist.
    async fn validate(&self, job_queue: &str, job_definition: &str) -> Result<()>;

    async fn submit(&self, request: &BatchSubmitRequest) -> Result<JobId>;

    /// Describe up to 100 jobs in one call.
    async fn describe(&self, job_ids: &[JobId]) -> Result<Vec<BatchJobStatus>>;
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

/// Key-addressed object store with directory sync.
///
/// Keys are relative to the store's configured root (bucket + prefix). All
/// operations may fail transiently; use [`with_retries`] at call sites that
/// must survive blips.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Mirror a local directory up under `prefix`.
    async fn sync_up(&self, local_dir: &Path, prefix: &str) -> Result<()>;

    /// Mirror the objects under `prefix` down into a local directory.
    async fn sync_down(&self, prefix: &str, local_dir: &Path) -> Result<()>;

    /// Keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human-readable location of the store root, for logging.
    fn location(&self) -> String;
}

/// Retry an async operation with bounded linear backoff.
///
/// Used for transient object-store and service failures. Delays are
/// 250 ms, 500 ms, ... between attempts.
pub async fn with_retries<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(what, attempt, error = %e, "transient operation failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("{what} failed"))
        .context(format!("{what} failed after {attempts} attempts")))
}

// ---------------------------------------------------------------------------
// Subprocess helpers
// ---------------------------------------------------------------------------

/// Run an external command with a deadline, returning its output.
pub(crate) async fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
    what: &str,
) -> Result<Output> {
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow::anyhow!("{what} timed out after {timeout:?}"))?
        .with_context(|| format!("failed to run {what}"))?;
    Ok(output)
}

/// Bail with the command's stderr if it exited nonzero.
pub(crate) fn ensure_success(output: &Output, what: &str) -> Result<()> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed: {}", stderr.trim());
    }
    Ok(())
}
