//! Run-level error taxonomy.
//!
//! Task-level failures (submission rejected, worker body failed, result
//! artifact missing) are absorbed by the retry path inside the backends and
//! never abort a run. The variants here are the ones that do.

use std::path::PathBuf;

use thiserror::Error;

use crate::plan::PlanError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The plan failed validation. Fatal; `run` is never entered.
    #[error("invalid plan: {0}")]
    PlanInvalid(#[from] PlanError),

    /// An external service was not reachable during initialization.
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The run-wide wall-clock ceiling was exceeded. Remaining non-terminal
    /// tasks are reported as failed with `error = "timeout"`.
    #[error("run exceeded wall-clock ceiling of {0:?}")]
    Timeout(std::time::Duration),

    /// A canonical state file could not be parsed. The state directory is
    /// preserved for inspection.
    #[error("state file {path} is corrupted: {reason}")]
    StateCorrupted { path: PathBuf, reason: String },

    /// The run was aborted by an external interruption signal.
    #[error("run interrupted")]
    Interrupted,
}
