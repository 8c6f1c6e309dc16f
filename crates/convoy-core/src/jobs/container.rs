//! Docker implementation of [`ContainerRuntime`].
//!
//! Shells out to the `docker` CLI. Containers are created detached with the
//! task output directory bind-mounted; the backend polls their state and
//! collects results from the mount after exit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::{ensure_success, run_with_timeout};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to launch one worker container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// (host path, container path) bind mounts.
    pub volumes: Vec<(PathBuf, String)>,
    pub network: Option<String>,
    /// Command to run inside the container; empty uses the image default.
    pub command: Vec<String>,
}

/// Observed container state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i32),
    /// The container no longer exists.
    Gone,
}

/// The local container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the image is available locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create the named network if it does not exist yet.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Start a detached container; returns the container id.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    async fn status(&self, container_id: &str) -> Result<ContainerState>;

    /// Last `lines` of combined stdout/stderr.
    async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String>;

    /// Stop (grace period) then remove the container. Idempotent.
    async fn stop_and_remove(&self, container_id: &str) -> Result<()>;
}

/// Container runtime backed by the `docker` CLI.
#[derive(Debug, Default, Clone)]
pub struct DockerRuntime;

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let mut cmd = Command::new("docker");
        cmd.args(["image", "inspect", image]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "docker image inspect").await?;
        Ok(output.status.success())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["network", "inspect", name]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "docker network inspect").await?;
        if output.status.success() {
            return Ok(());
        }

        let mut cmd = Command::new("docker");
        cmd.args(["network", "create", "--driver", "bridge", name]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "docker network create").await?;
        ensure_success(&output, "docker network create")
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        // Remove a stale container with the same name from a previous run.
        let mut rm = Command::new("docker");
        rm.args(["rm", "-f", &spec.name]);
        let _ = run_with_timeout(&mut rm, COMMAND_TIMEOUT, "docker rm").await;

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &spec.name]);
        if let Some(network) = &spec.network {
            cmd.args(["--network", network]);
        }
        for (name, value) in &spec.env {
            cmd.args(["-e", &format!("{name}={value}")]);
        }
        for (host, container) in &spec.volumes {
            cmd.args(["-v", &format!("{}:{container}", host.display())]);
        }
        cmd.arg(&spec.image);
        cmd.args(&spec.command);

        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "docker run").await?;
        ensure_success(&output, "docker run")?;
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if container_id.is_empty() {
            bail!("docker run returned no container id for {}", spec.name);
        }
        Ok(container_id)
    }

    async fn status(&self, container_id: &str) -> Result<ContainerState> {
        let mut cmd = Command::new("docker");
        cmd.args([
            "inspect",
            "-f",
            "{{.State.Status}} {{.State.ExitCode}}",
            container_id,
        ]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "docker inspect").await?;
        if !output.status.success() {
            return Ok(ContainerState::Gone);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.split_whitespace();
        let status = parts.next().unwrap_or("");
        match status {
            "running" | "created" | "restarting" => Ok(ContainerState::Running),
            "exited" | "dead" => {
                let code = parts
                    .next()
                    .and_then(|c| c.parse::<i32>().ok())
                    .context("could not parse container exit code")?;
                Ok(ContainerState::Exited(code))
            }
            _ => Ok(ContainerState::Gone),
        }
    }

    async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(["logs", "--tail", &lines.to_string(), container_id]);
        let output = run_with_timeout(&mut cmd, COMMAND_TIMEOUT, "docker logs").await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        let mut stop = Command::new("docker");
        stop.args(["stop", "-t", "10", container_id]);
        let _ = run_with_timeout(&mut stop, COMMAND_TIMEOUT, "docker stop").await;

        let mut rm = Command::new("docker");
        rm.args(["rm", "-f", container_id]);
        let _ = run_with_timeout(&mut rm, COMMAND_TIMEOUT, "docker rm").await;
        Ok(())
    }
}
