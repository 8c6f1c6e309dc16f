//! AWS implementations of [`BatchService`] and [`ObjectStore`], shelling
//! out to the `aws` CLI the same way the cluster variant shells out to the
//! SLURM tools.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::{
    BatchJobState, BatchJobStatus, BatchService, BatchSubmitRequest, JobId, ObjectStore,
    ensure_success, run_with_timeout,
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Verify the `aws` CLI is installed and answers.
pub async fn verify_aws_cli() -> Result<()> {
    let mut cmd = Command::new("aws");
    cmd.arg("--version");
    let output = run_with_timeout(&mut cmd, Duration::from_secs(10), "aws --version").await?;
    ensure_success(&output, "aws --version")
}

// ---------------------------------------------------------------------------
// Batch service
// ---------------------------------------------------------------------------

/// Managed batch service backed by `aws batch`.
#[derive(Debug, Clone)]
pub struct AwsBatchService {
    pub region: String,
}

impl AwsBatchService {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

#[async_trait]
impl BatchService for AwsBatchService {
    async fn validate(&self, job_queue: &str, job_definition: &str) -> Result<()> {
        let mut cmd = Command::new("aws");
        cmd.args([
            "batch",
            "describe-job-queues",
            "--job-queues",
            job_queue,
            "--region",
            &self.region,
        ]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "describe-job-queues").await?;
        ensure_success(&output, "describe-job-queues")?;
        let response: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("could not parse describe-job-queues response")?;
        if response["jobQueues"]
            .as_array()
            .is_none_or(|queues| queues.is_empty())
        {
            bail!("job queue {job_queue:?} not found");
        }

        let mut cmd = Command::new("aws");
        cmd.args([
            "batch",
            "describe-job-definitions",
            "--job-definition-name",
            job_definition,
            "--status",
            "ACTIVE",
            "--region",
            &self.region,
        ]);
        let output =
            run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "describe-job-definitions").await?;
        ensure_success(&output, "describe-job-definitions")?;
        let response: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("could not parse describe-job-definitions response")?;
        if response["jobDefinitions"]
            .as_array()
            .is_none_or(|defs| defs.is_empty())
        {
            bail!("job definition {job_definition:?} not found or not active");
        }
        Ok(())
    }

    async fn submit(&self, request: &BatchSubmitRequest) -> Result<JobId> {
        let mut cmd = Command::new("aws");
        cmd.args([
            "batch",
            "submit-job",
            "--job-name",
            &request.job_name,
            "--job-queue",
            &request.job_queue,
            "--job-definition",
            &request.job_definition,
            "--region",
            &self.region,
        ]);

        if !request.depends_on.is_empty() {
            let depends_on: Vec<_> = request
                .depends_on
                .iter()
                .map(|job_id| serde_json::json!({"jobId": job_id, "type": "SEQUENTIAL"}))
                .collect();
            cmd.args([
                "--depends-on",
                &serde_json::Value::Array(depends_on).to_string(),
            ]);
        }

        let overrides = serde_json::json!({
            "resourceRequirements": [
                {"type": "VCPU", "value": request.vcpus.to_string()},
                {"type": "MEMORY", "value": request.memory_mb.to_string()},
            ],
            "environment": request.environment.iter()
                .map(|(name, value)| serde_json::json!({"name": name, "value": value}))
                .collect::<Vec<_>>(),
        });
        cmd.args(["--container-overrides", &overrides.to_string()]);

        if request.timeout_secs > 0 {
            let timeout = serde_json::json!({"attemptDurationSeconds": request.timeout_secs});
            cmd.args(["--timeout", &timeout.to_string()]);
        }

        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "submit-job").await?;
        ensure_success(&output, "submit-job")?;

        let response: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("could not parse submit-job response")?;
        response["jobId"]
            .as_str()
            .map(str::to_owned)
            .context("submit-job response carried no jobId")
    }

    async fn describe(&self, job_ids: &[JobId]) -> Result<Vec<BatchJobStatus>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = Command::new("aws");
        cmd.args(["batch", "describe-jobs", "--jobs"]);
        cmd.args(job_ids);
        cmd.args(["--region", &self.region]);

        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "describe-jobs").await?;
        ensure_success(&output, "describe-jobs")?;

        let response: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("could not parse describe-jobs response")?;
        let jobs = response["jobs"].as_array().cloned().unwrap_or_default();

        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Some(job_id) = job["jobId"].as_str() else {
                continue;
            };
            let Some(state) = job["status"].as_str().and_then(BatchJobState::from_native) else {
                continue;
            };
            statuses.push(BatchJobStatus {
                job_id: job_id.to_owned(),
                state,
                reason: job["statusReason"].as_str().map(str::to_owned),
            });
        }
        Ok(statuses)
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

/// Object store backed by `aws s3` under `s3://bucket/prefix`.
#[derive(Debug, Clone)]
pub struct S3Store {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
}

impl S3Store {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            region: region.into(),
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}/{}", self.bucket, self.prefix, key)
    }

    /// Verify the bucket is reachable with the current credentials.
    pub async fn verify_access(&self) -> Result<()> {
        let mut cmd = Command::new("aws");
        cmd.args([
            "s3",
            "ls",
            &format!("s3://{}/", self.bucket),
            "--region",
            &self.region,
        ]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "s3 ls").await?;
        ensure_success(&output, "s3 ls")
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let tmp = tempfile_path(key);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to stage upload for {key}"))?;
        let mut cmd = Command::new("aws");
        cmd.arg("s3").arg("cp").arg(&tmp).arg(self.uri(key));
        cmd.args(["--region", &self.region]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "s3 cp").await;
        let _ = tokio::fs::remove_file(&tmp).await;
        let output = output?;
        ensure_success(&output, "s3 cp")
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let tmp = tempfile_path(key);
        let mut cmd = Command::new("aws");
        cmd.arg("s3").arg("cp").arg(self.uri(key)).arg(&tmp);
        cmd.args(["--region", &self.region]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "s3 cp").await?;
        ensure_success(&output, "s3 cp")?;
        let bytes = tokio::fs::read(&tmp)
            .await
            .with_context(|| format!("failed to read downloaded object {key}"))?;
        let _ = tokio::fs::remove_file(&tmp).await;
        Ok(bytes)
    }

    async fn sync_up(&self, local_dir: &Path, prefix: &str) -> Result<()> {
        let mut cmd = Command::new("aws");
        cmd.arg("s3").arg("sync").arg(local_dir).arg(self.uri(prefix));
        cmd.args(["--region", &self.region]);
        let output = run_with_timeout(&mut cmd, SYNC_TIMEOUT, "s3 sync").await?;
        ensure_success(&output, "s3 sync")
    }

    async fn sync_down(&self, prefix: &str, local_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(local_dir)
            .await
            .with_context(|| format!("failed to create {}", local_dir.display()))?;
        let mut cmd = Command::new("aws");
        cmd.arg("s3").arg("sync").arg(self.uri(prefix)).arg(local_dir);
        cmd.args(["--region", &self.region]);
        let output = run_with_timeout(&mut cmd, SYNC_TIMEOUT, "s3 sync").await?;
        ensure_success(&output, "s3 sync")
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut cmd = Command::new("aws");
        cmd.args([
            "s3",
            "ls",
            &format!("{}/", self.uri(prefix)),
            "--region",
            &self.region,
        ]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "s3 ls").await?;
        ensure_success(&output, "s3 ls")?;

        // Lines look like: "2024-01-01 00:00:00      123 name.json".
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().nth(3))
            .map(|name| format!("{prefix}/{name}"))
            .collect())
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Scratch path for staging a single object transfer.
fn tempfile_path(key: &str) -> std::path::PathBuf {
    let name = key.replace('/', "_");
    std::env::temp_dir().join(format!("convoy-{}-{name}", std::process::id()))
}
