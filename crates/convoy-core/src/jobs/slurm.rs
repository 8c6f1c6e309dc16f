//! SLURM implementation of [`JobScheduler`], shelling out to `sbatch`,
//! `squeue`, `sacct`, and `scancel`.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::{JobId, JobRequest, JobScheduler, JobState, ensure_success, run_with_timeout};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Job scheduler backed by the SLURM CLI on the submit host.
#[derive(Debug, Default, Clone)]
pub struct SlurmScheduler;

#[async_trait]
impl JobScheduler for SlurmScheduler {
    async fn submit(&self, request: &JobRequest) -> Result<JobId> {
        let mut cmd = Command::new("sbatch");
        cmd.args(request.resources.sbatch_args());
        cmd.args(["--job-name", &request.job_name]);
        cmd.arg("--output").arg(&request.stdout_path);
        cmd.arg("--error").arg(&request.stderr_path);
        if !request.dependencies.is_empty() {
            cmd.args([
                "--dependency",
                &format!("afterok:{}", request.dependencies.join(":")),
            ]);
        }
        cmd.arg(&request.script);

        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "sbatch").await?;
        ensure_success(&output, "sbatch")?;

        // Output format: "Submitted batch job 12345".
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .split_whitespace()
            .last()
            .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
            .with_context(|| format!("could not parse sbatch output: {stdout:?}"))?;
        Ok(job_id.to_owned())
    }

    async fn list_active(&self) -> Result<HashSet<JobId>> {
        let user = std::env::var("USER").unwrap_or_default();
        let mut cmd = Command::new("squeue");
        cmd.args(["-u", &user, "-h", "-o", "%A"]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "squeue").await?;
        ensure_success(&output, "squeue")?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_owned)
            .collect())
    }

    async fn describe(&self, job_id: &JobId) -> Result<JobState> {
        let mut cmd = Command::new("sacct");
        cmd.args(["-j", job_id, "-n", "-o", "State", "-P"]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "sacct").await?;
        ensure_success(&output, "sacct")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // The first line is the main job record; step records follow.
        let main_state = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.split('|').next().unwrap_or(l).to_owned());

        let Some(state) = main_state else {
            // Not yet in accounting: still queued.
            return Ok(JobState::Queued);
        };

        Ok(match state.as_str() {
            "COMPLETED" => JobState::Completed,
            "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" => {
                JobState::Failed(state)
            }
            "PENDING" => JobState::Queued,
            // RUNNING, COMPLETING, and anything unrecognized: still active.
            _ => JobState::Running,
        })
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let mut cmd = Command::new("scancel");
        cmd.arg(job_id);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "scancel").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("scancel {job_id} failed: {}", stderr.trim());
        }
        Ok(())
    }
}
