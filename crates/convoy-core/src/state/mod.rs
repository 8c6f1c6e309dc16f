//! Durable, crash-tolerant state directory used by the distributed backends.
//!
//! Layout under the state root (filenames and schemas are fixed so an
//! external operator can inspect a run):
//!
//! ```text
//! <state-root>/
//!   marker.json            run metadata: run_id, created_at, backend
//!   tasks.json             { task_id -> state } plus per-bucket id lists
//!   jobs.json              { task_id -> backend job id }
//!   task_definitions/<id>.json   task payload + plan snapshot + requirements
//!   results/<id>.json      written by the worker on completion/failure
//!   scripts/<id>.sh        generated job scripts (cluster variant)
//!   logs/<id>.{out,err}    job stdout/stderr (cluster variant)
//! ```
//!
//! Writers use temp-file + fsync + rename (atomic on POSIX) for whole-file
//! replacement, or an exclusive advisory lock for in-place rewrites. Readers
//! take a shared lock. The orchestrator is the sole writer of `tasks.json`
//! and `jobs.json` within one run; result files are single-writer per task
//! id and need no locking.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::model::{Plan, Task, TaskResult, TaskStatus};

// ---------------------------------------------------------------------------
// File schemas
// ---------------------------------------------------------------------------

/// `marker.json`: identifies the run a state directory belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerFile {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub backend: String,
}

/// `tasks.json`: status map plus parallel per-bucket id lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksFile {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskStatus>,
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub in_progress: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl TasksFile {
    /// Move a task into the bucket for `status`, removing it from the rest.
    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) {
        for bucket in [
            &mut self.pending,
            &mut self.in_progress,
            &mut self.completed,
            &mut self.failed,
        ] {
            bucket.retain(|id| id != task_id);
        }
        let bucket = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Unknown => {
                self.tasks.remove(task_id);
                return;
            }
        };
        bucket.push(task_id.to_owned());
        self.tasks.insert(task_id.to_owned(), status);
    }

    pub fn status_of(&self, task_id: &str) -> TaskStatus {
        self.tasks
            .get(task_id)
            .copied()
            .unwrap_or(TaskStatus::Unknown)
    }
}

/// `jobs.json`: mapping from task id to the external scheduler's job id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: BTreeMap<String, String>,
    #[serde(default)]
    pub run_id: String,
}

/// `task_definitions/<id>.json`: everything a remote worker needs to run
/// one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task: Task,
    pub requirements: String,
    pub use_real_executors: bool,
    pub output_dir: String,
    pub plan: Plan,
    pub run_id: String,
}

// ---------------------------------------------------------------------------
// StateDir
// ---------------------------------------------------------------------------

/// Handle over a state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join("marker.json")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.root.join("jobs.json")
    }

    pub fn task_definitions_dir(&self) -> PathBuf {
        self.root.join("task_definitions")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn script_path(&self, task_id: &str) -> PathBuf {
        self.scripts_dir().join(format!("{task_id}.sh"))
    }

    pub fn log_paths(&self, task_id: &str) -> (PathBuf, PathBuf) {
        (
            self.logs_dir().join(format!("{task_id}.out")),
            self.logs_dir().join(format!("{task_id}.err")),
        )
    }

    pub fn result_path(&self, task_id: &str) -> PathBuf {
        self.results_dir().join(format!("{task_id}.json"))
    }

    pub fn task_definition_path(&self, task_id: &str) -> PathBuf {
        self.task_definitions_dir().join(format!("{task_id}.json"))
    }

    /// Create the directory structure and seed the canonical state files.
    pub fn init(&self, run_id: &str, backend: &str) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.task_definitions_dir(),
            self.results_dir(),
            self.scripts_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        }

        atomic_write_json(
            &self.marker_path(),
            &MarkerFile {
                run_id: run_id.to_owned(),
                created_at: Utc::now(),
                backend: backend.to_owned(),
            },
        )?;
        atomic_write_json(&self.tasks_path(), &TasksFile::default())?;
        atomic_write_json(
            &self.jobs_path(),
            &JobsFile {
                jobs: BTreeMap::new(),
                run_id: run_id.to_owned(),
            },
        )?;
        Ok(())
    }

    pub fn read_marker(&self) -> Result<MarkerFile> {
        read_json_locked(&self.marker_path())
    }

    pub fn read_tasks(&self) -> Result<TasksFile> {
        read_json_locked(&self.tasks_path())
    }

    pub fn write_tasks(&self, tasks: &TasksFile) -> Result<()> {
        write_json_locked(&self.tasks_path(), tasks)
    }

    /// Read-modify-write of `tasks.json` for a single status transition.
    ///
    /// The orchestrator is the sole writer within one run, so the
    /// read-then-write pair does not race.
    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut tasks = self.read_tasks()?;
        tasks.set_status(task_id, status);
        self.write_tasks(&tasks)
    }

    pub fn read_jobs(&self) -> Result<JobsFile> {
        read_json_locked(&self.jobs_path())
    }

    pub fn write_jobs(&self, jobs: &JobsFile) -> Result<()> {
        write_json_locked(&self.jobs_path(), jobs)
    }

    /// Record (or replace, on retry) the external job id for a task.
    pub fn record_job(&self, task_id: &str, job_id: &str) -> Result<()> {
        let mut jobs = self.read_jobs()?;
        jobs.jobs.insert(task_id.to_owned(), job_id.to_owned());
        self.write_jobs(&jobs)
    }

    pub fn write_task_definition(&self, def: &TaskDefinition) -> Result<()> {
        atomic_write_json(&self.task_definition_path(&def.task.id), def)
    }

    /// Persist a result under its own file. Single writer per task id, so
    /// no lock is required on the results directory.
    pub fn write_result(&self, result: &TaskResult) -> Result<()> {
        atomic_write_json(&self.result_path(&result.task_id), result)
    }

    /// Read one task's result file, if present.
    pub fn read_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        let path = self.result_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        read_json_locked(&path).map(Some)
    }

    /// Read every result file currently present.
    pub fn read_all_results(&self) -> Result<Vec<TaskResult>> {
        let dir = self.results_dir();
        let mut results = Vec::new();
        if !dir.exists() {
            return Ok(results);
        }
        let mut entries: Vec<_> = fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();
        for path in entries {
            results.push(read_json_locked(&path)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Write JSON atomically: temp file in the same directory, fsync, rename.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize state")?;
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} over {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Read JSON under a shared advisory lock.
///
/// A parse failure is [`OrchestratorError::StateCorrupted`]; the file is
/// left untouched for inspection.
pub fn read_json_locked<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    FileExt::lock_shared(&file)
        .with_context(|| format!("failed to lock {} for reading", path.display()))?;
    let mut contents = String::new();
    let read_result = file.read_to_string(&mut contents);
    let _ = FileExt::unlock(&file);
    read_result.with_context(|| format!("failed to read {}", path.display()))?;

    serde_json::from_str(&contents).map_err(|e| {
        OrchestratorError::StateCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Rewrite JSON in place under an exclusive advisory lock.
pub fn write_json_locked<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize state")?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    FileExt::lock_exclusive(&file)
        .with_context(|| format!("failed to lock {} for writing", path.display()))?;
    let write_result = file
        .set_len(0)
        .and_then(|_| file.rewind())
        .and_then(|_| file.write_all(&bytes))
        .and_then(|_| file.flush());
    let _ = FileExt::unlock(&file);
    write_result.with_context(|| format!("failed to rewrite {}", path.display()))?;
    Ok(())
}
