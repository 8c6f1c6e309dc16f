mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use tokio_util::sync::CancellationToken;

use convoy_core::backend::batch::{BatchBackend, BatchConfig};
use convoy_core::backend::cluster::{ClusterBackend, ClusterConfig};
use convoy_core::backend::container::{ContainerBackend, ContainerConfig};
use convoy_core::backend::threading::{ThreadingBackend, ThreadingConfig};
use convoy_core::backend::{BackendKind, ExecutionBackend};
use convoy_core::error::OrchestratorError;
use convoy_core::exec::{Planner, SimulatedWorker, StandinPlanner};
use convoy_core::jobs::aws::{AwsBatchService, S3Store};
use convoy_core::jobs::container::DockerRuntime;
use convoy_core::jobs::slurm::SlurmScheduler;
use convoy_core::jobs::ResourceSpec;
use convoy_core::model::{Plan, RunContext, RunSummary};
use convoy_core::plan::parse_plan_json;
use convoy_core::retry::RetryPolicy;
use convoy_core::scheduler::{SchedulerConfig, run_plan};

/// Exit code used when the run is interrupted from outside.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "convoy",
    about = "Parallel task orchestrator with pluggable execution backends"
)]
struct Cli {
    /// Project requirements description
    requirements: String,

    /// Maximum number of parallel executors
    #[arg(long, short = 'm', default_value_t = 5)]
    max_executors: usize,

    /// Output directory for generated files
    #[arg(long, short = 'o')]
    output_dir: Option<String>,

    /// Use real executors instead of simulating task execution
    #[arg(long)]
    real: bool,

    /// Load a planner-emitted plan JSON file instead of planning
    #[arg(long)]
    plan_file: Option<PathBuf>,

    /// Execute with the in-process worker pool (default)
    #[arg(long, group = "backend")]
    threading: bool,

    /// Execute on the local HPC cluster scheduler
    #[arg(long, group = "backend")]
    cluster: bool,

    /// Execute on a managed cloud cluster
    #[arg(long, group = "backend")]
    cloud_cluster: bool,

    /// Execute on the managed cloud batch service
    #[arg(long, group = "backend")]
    cloud_batch: bool,

    /// Execute in local containers
    #[arg(long, group = "backend")]
    containers: bool,

    /// Maximum retries per task before it fails terminally
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Base delay between retries, in seconds
    #[arg(long, default_value_t = 5.0)]
    retry_delay: f64,

    /// Use a constant retry delay instead of exponential backoff
    #[arg(long)]
    no_backoff: bool,

    /// Seconds between status polls (distributed backends)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Run-wide wall-clock ceiling in seconds
    #[arg(long, default_value_t = 7200)]
    run_timeout: u64,

    #[command(flatten)]
    cluster_opts: ClusterOpts,

    #[command(flatten)]
    cloud_opts: CloudOpts,

    #[command(flatten)]
    batch_opts: BatchOpts,

    #[command(flatten)]
    container_opts: ContainerOpts,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Cluster Options")]
struct ClusterOpts {
    /// Cluster partition name
    #[arg(long, default_value = "default")]
    cluster_partition: String,

    /// Job time limit
    #[arg(long, default_value = "01:00:00")]
    cluster_time: String,

    /// Memory per job
    #[arg(long, default_value = "4G")]
    cluster_mem: String,

    /// CPUs per task
    #[arg(long, default_value_t = 1)]
    cluster_cpus: u32,

    /// GPUs per task
    #[arg(long, default_value_t = 0)]
    cluster_gpus: u32,

    /// GPU-specific partition name
    #[arg(long)]
    cluster_gpu_partition: Option<String>,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Cloud Options")]
struct CloudOpts {
    /// Managed cluster name
    #[arg(long)]
    cloud_cluster_name: Option<String>,

    /// Cloud region
    #[arg(long)]
    region: Option<String>,

    /// Object-store bucket for state synchronization
    #[arg(long)]
    bucket: Option<String>,

    /// Object-store key prefix
    #[arg(long, default_value = "convoy")]
    prefix: String,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Batch Options")]
struct BatchOpts {
    /// Batch job queue name (required for --cloud-batch)
    #[arg(long)]
    batch_job_queue: Option<String>,

    /// Batch job definition name (required for --cloud-batch)
    #[arg(long)]
    batch_job_definition: Option<String>,

    /// vCPUs per job
    #[arg(long, default_value_t = 1)]
    batch_vcpus: u32,

    /// Memory per job in MB
    #[arg(long, default_value_t = 2048)]
    batch_memory: u32,

    /// Per-job timeout in seconds (0 disables it)
    #[arg(long, default_value_t = 3600)]
    batch_timeout: u32,
}

#[derive(Args, Debug)]
#[command(next_help_heading = "Container Options")]
struct ContainerOpts {
    /// Container image for worker containers
    #[arg(long, default_value = "convoy-worker:latest")]
    container_image: String,

    /// Container network name
    #[arg(long)]
    container_network: Option<String>,
}

impl Cli {
    fn backend_kind(&self) -> BackendKind {
        if self.cluster {
            BackendKind::Cluster
        } else if self.cloud_cluster {
            BackendKind::CloudCluster
        } else if self.cloud_batch {
            BackendKind::CloudBatch
        } else if self.containers {
            BackendKind::Containers
        } else {
            BackendKind::Threading
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs_f64(self.retry_delay.max(0.0)),
            exponential_backoff: !self.no_backoff,
            backoff_multiplier: 2.0,
        }
    }
}

/// Build the concrete backend selected on the command line.
fn build_backend(
    cli: &Cli,
    ctx: &RunContext,
    region: &str,
    bucket: Option<&str>,
) -> Result<Arc<dyn ExecutionBackend>> {
    let retry = cli.retry_policy();
    let kind = cli.backend_kind();

    let resources = ResourceSpec {
        partition: cli.cluster_opts.cluster_partition.clone(),
        time_limit: cli.cluster_opts.cluster_time.clone(),
        memory: cli.cluster_opts.cluster_mem.clone(),
        cpus_per_task: cli.cluster_opts.cluster_cpus,
        gpus_per_task: cli.cluster_opts.cluster_gpus,
        gpu_partition: cli.cluster_opts.cluster_gpu_partition.clone(),
    };

    let backend: Arc<dyn ExecutionBackend> = match kind {
        BackendKind::Threading => {
            if cli.real {
                bail!(
                    "no real executor service is wired into the threading backend; \
                     drop --real or pick a distributed backend"
                );
            }
            let config = ThreadingConfig {
                retry,
                ..ThreadingConfig::default()
            };
            Arc::new(ThreadingBackend::new(
                Arc::new(SimulatedWorker::default()),
                config,
            ))
        }
        BackendKind::Cluster | BackendKind::CloudCluster => {
            let mut config = ClusterConfig {
                resources,
                retry,
                ..ClusterConfig::default()
            };
            if let Some(secs) = cli.poll_interval {
                config.poll_interval = Duration::from_secs(secs);
            }
            config.max_wait = Duration::from_secs(cli.run_timeout);

            let scheduler = Arc::new(SlurmScheduler);
            let backend = ClusterBackend::new(ctx.clone(), scheduler, config);
            if kind == BackendKind::CloudCluster {
                if let Some(name) = &cli.cloud_opts.cloud_cluster_name {
                    tracing::info!(cluster = %name, "targeting managed cluster");
                }
                let bucket = bucket.context(
                    "--bucket (or CONVOY_BUCKET / config default) is required for --cloud-cluster",
                )?;
                let store = S3Store::new(
                    bucket,
                    format!("{}/{}", cli.cloud_opts.prefix, ctx.run_id),
                    region,
                );
                Arc::new(backend.with_object_store(Arc::new(store)))
            } else {
                Arc::new(backend)
            }
        }
        BackendKind::CloudBatch => {
            let job_queue = cli
                .batch_opts
                .batch_job_queue
                .clone()
                .context("--batch-job-queue is required for --cloud-batch")?;
            let job_definition = cli
                .batch_opts
                .batch_job_definition
                .clone()
                .context("--batch-job-definition is required for --cloud-batch")?;
            let bucket = bucket.context(
                "--bucket (or CONVOY_BUCKET / config default) is required for --cloud-batch",
            )?;

            let mut config = BatchConfig {
                job_queue,
                job_definition,
                vcpus: cli.batch_opts.batch_vcpus,
                memory_mb: cli.batch_opts.batch_memory,
                job_timeout_secs: cli.batch_opts.batch_timeout,
                retry,
                ..BatchConfig::default()
            };
            if let Some(secs) = cli.poll_interval {
                config.poll_interval = Duration::from_secs(secs);
            }
            config.max_wait = Duration::from_secs(cli.run_timeout);

            let service = Arc::new(AwsBatchService::new(region));
            let store = S3Store::new(
                bucket,
                format!("{}/{}", cli.cloud_opts.prefix, ctx.run_id),
                region,
            );
            Arc::new(BatchBackend::new(
                ctx.clone(),
                service,
                Arc::new(store),
                config,
            ))
        }
        BackendKind::Containers => {
            let config = ContainerConfig {
                image: cli.container_opts.container_image.clone(),
                network: cli.container_opts.container_network.clone(),
                retry,
                ..ContainerConfig::default()
            };
            Arc::new(ContainerBackend::new(Arc::new(DockerRuntime), config))
        }
    };
    Ok(backend)
}

/// Obtain the plan: from a planner-emitted file, or the built-in planner.
async fn obtain_plan(cli: &Cli) -> Result<Plan> {
    if let Some(path) = &cli.plan_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        let plan = parse_plan_json(&contents, cli.max_executors)?;
        tracing::info!(tasks = plan.len(), file = %path.display(), "loaded plan");
        Ok(plan)
    } else {
        let (num_tasks, plan) = StandinPlanner
            .plan(&cli.requirements, cli.max_executors)
            .await?;
        tracing::info!(tasks = num_tasks, "created execution plan");
        Ok(plan)
    }
}

fn print_summary(kind: BackendKind, summary: &RunSummary) {
    println!("EXECUTION COMPLETE");
    println!("Backend: {kind}");
    println!(
        "Tasks completed: {} / {}",
        summary.completed, summary.total_tasks
    );
    if !summary.skipped.is_empty() {
        println!("Skipped (failed dependency): {}", summary.skipped.join(", "));
    }
    println!("Success rate: {}", summary.success_rate);
    println!("Files created: {}", summary.total_files_created);
    println!("Total time: {:.2}s", summary.total_execution_secs);
}

async fn run(cli: Cli) -> Result<u8> {
    if cli.max_executors < 1 {
        bail!("--max-executors must be at least 1");
    }
    if cli.max_executors > 100 {
        tracing::warn!(
            max_executors = cli.max_executors,
            "executor budget above 100; most deployments saturate far earlier"
        );
    }

    let defaults = config::ResolvedDefaults::resolve(
        cli.output_dir.as_deref(),
        cli.cloud_opts.region.as_deref(),
        cli.cloud_opts.bucket.as_deref(),
    );

    let ctx = RunContext::new(
        defaults.output_dir.clone(),
        cli.requirements.clone(),
        cli.real,
    );
    let mut plan = obtain_plan(&cli).await?;
    plan.executor_budget = cli.max_executors;

    let backend = build_backend(&cli, &ctx, &defaults.region, defaults.bucket.as_deref())?;
    let kind = cli.backend_kind();

    // External interruption (ctrl-c) aborts the run; partial state stays
    // on disk.
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let scheduler_config = SchedulerConfig {
        run_timeout: Duration::from_secs(cli.run_timeout),
    };

    match run_plan(&plan, &ctx, backend, &scheduler_config, cancel).await {
        Ok(summary) => {
            print_summary(kind, &summary);
            println!("Output directory: {}", ctx.output_dir.display());
            Ok(if summary.success { 0 } else { 1 })
        }
        Err(e) => {
            if matches!(
                e.downcast_ref::<OrchestratorError>(),
                Some(OrchestratorError::Interrupted)
            ) {
                eprintln!("convoy: interrupted");
                return Ok(EXIT_INTERRUPTED);
            }
            Err(e)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("convoy: {e:#}");
            ExitCode::from(1)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::try_parse_from(["convoy", "build a todo app"]).unwrap();
        assert_eq!(cli.requirements, "build a todo app");
        assert_eq!(cli.max_executors, 5);
        assert_eq!(cli.backend_kind(), BackendKind::Threading);
        assert_eq!(cli.max_retries, 3);
        assert_eq!(cli.run_timeout, 7200);
    }

    #[test]
    fn backend_selectors_are_mutually_exclusive() {
        let err = Cli::try_parse_from(["convoy", "x", "--cluster", "--cloud-batch"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn each_backend_selector_parses() {
        for (flag, kind) in [
            ("--threading", BackendKind::Threading),
            ("--cluster", BackendKind::Cluster),
            ("--cloud-cluster", BackendKind::CloudCluster),
            ("--cloud-batch", BackendKind::CloudBatch),
            ("--containers", BackendKind::Containers),
        ] {
            let cli = Cli::try_parse_from(["convoy", "x", flag]).unwrap();
            assert_eq!(cli.backend_kind(), kind, "flag {flag}");
        }
    }

    #[test]
    fn cluster_options_parse() {
        let cli = Cli::try_parse_from([
            "convoy",
            "train models",
            "--cluster",
            "--cluster-partition",
            "gpu",
            "--cluster-gpus",
            "2",
            "--cluster-mem",
            "16G",
            "--max-executors",
            "8",
        ])
        .unwrap();
        assert_eq!(cli.cluster_opts.cluster_partition, "gpu");
        assert_eq!(cli.cluster_opts.cluster_gpus, 2);
        assert_eq!(cli.cluster_opts.cluster_mem, "16G");
        assert_eq!(cli.max_executors, 8);
    }

    #[test]
    fn batch_options_parse() {
        let cli = Cli::try_parse_from([
            "convoy",
            "build a website",
            "--cloud-batch",
            "--batch-job-queue",
            "my-queue",
            "--batch-job-definition",
            "my-def",
            "--bucket",
            "my-bucket",
            "--batch-vcpus",
            "4",
            "--batch-memory",
            "16384",
        ])
        .unwrap();
        assert_eq!(cli.batch_opts.batch_job_queue.as_deref(), Some("my-queue"));
        assert_eq!(cli.batch_opts.batch_vcpus, 4);
        assert_eq!(cli.batch_opts.batch_memory, 16384);
        assert_eq!(cli.cloud_opts.bucket.as_deref(), Some("my-bucket"));
    }

    #[test]
    fn retry_policy_reflects_flags() {
        let cli = Cli::try_parse_from([
            "convoy",
            "x",
            "--max-retries",
            "7",
            "--retry-delay",
            "0.5",
            "--no-backoff",
        ])
        .unwrap();
        let policy = cli.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert!(!policy.exponential_backoff);
    }

    #[test]
    fn real_with_threading_is_rejected() {
        let cli = Cli::try_parse_from(["convoy", "x", "--threading", "--real"]).unwrap();
        let ctx = RunContext::new(PathBuf::from("/tmp/out"), "x".to_owned(), true);
        let err = build_backend(&cli, &ctx, "eu-central-1", None).unwrap_err();
        assert!(err.to_string().contains("no real executor service"));
    }

    #[test]
    fn cloud_batch_requires_queue_definition_and_bucket() {
        let cli = Cli::try_parse_from(["convoy", "x", "--cloud-batch"]).unwrap();
        let ctx = RunContext::new(PathBuf::from("/tmp/out"), "x".to_owned(), false);
        let err = build_backend(&cli, &ctx, "eu-central-1", None).unwrap_err();
        assert!(err.to_string().contains("--batch-job-queue"));
    }
}
