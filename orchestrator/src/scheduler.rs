pub mod slurm;

pub use slurm::SlurmScheduler;

use crate::{config::ProductionConfig, database::JobSpec};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Batch status as the external scheduler reports it. Advisory only: the
/// monitor cross-checks against the job's output artifact before declaring
/// anything COMPLETED, and `Unknown` is expected for handles that have aged
/// out of the scheduler's own history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Unknown,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Queue full, controller unreachable and the like. Safe to retry by
    /// re-running submit; never consumes a job's retry budget.
    #[error("transient scheduler failure: {0}")]
    Transient(String),
    /// Malformed script, bad account, permission problems. Needs an
    /// operator fix, retrying is pointless.
    #[error("permanent scheduler failure: {0}")]
    Permanent(String),
    #[error("failed to render batch script {path}")]
    Render {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Boundary to the external batch scheduler.
///
/// Implementations are blocking I/O; the orchestration layer decides what
/// is retried (transient submit failures) and what is surfaced.
pub trait Scheduler {
    /// Render the submission script for one batch, returning its path.
    fn render_script(
        &self,
        batch_id: &str,
        jobs: &[JobSpec],
        config: &ProductionConfig,
        logs_dir: &Path,
    ) -> Result<PathBuf, SchedulerError>;

    /// Hand a rendered script to the scheduler, returning its handle.
    fn submit(&self, script: &Path) -> Result<i64, SchedulerError>;

    /// Current status of a previously submitted batch.
    fn query(&self, handle: i64) -> Result<ExternalStatus, SchedulerError>;

    /// Best-effort cancellation of a submitted batch.
    fn cancel(&self, handle: i64) -> Result<(), SchedulerError>;
}
