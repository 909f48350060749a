mod sqlite;

pub use sqlite::SharedConnection;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job store query failed")]
    Sqlite(#[from] rusqlite::Error),
    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidTransition {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("transition {from} -> {to} is not in the state table")]
    IllegalTransition { from: JobStatus, to: JobStatus },
    #[error("job {0} not found")]
    MissingJob(String),
    #[error("batch {0} not found")]
    MissingBatch(String),
    #[error("production metadata is missing, run init first")]
    MissingMeta,
}

/// Lifecycle of a single job.
///
/// The transition table lives in `can_transition_to`; every mutation of a
/// job row goes through it, so a stale reader can never push a job into a
/// state the table does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// COMPLETED and CANCELLED never leave their state. FAILED is only
    /// terminal once the retry budget is exhausted, which the retry policy
    /// decides, so it is not terminal here.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Queued, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a realization/redshift pair plus its orchestration
/// bookkeeping. Rows are never deleted, only transitioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub realization: u32,
    pub redshift: f64,
    pub batch_id: String,
    pub output_path: PathBuf,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub external_handle: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A group of jobs submitted together as one scheduler array job.
/// Immutable once its script is rendered; submission only fills the handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    pub id: String,
    pub script_path: Option<PathBuf>,
    pub external_handle: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Workflow stage the production has reached, single row per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStage {
    Initialized,
    Staged,
    Submitted,
}

impl WorkflowStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Staged => "staged",
            Self::Submitted => "submitted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Self::Initialized, Self::Staged, Self::Submitted]
            .into_iter()
            .find(|stage| stage.as_str() == value)
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionMeta {
    pub name: String,
    pub version: String,
    pub config_hash: String,
    pub provenance_tag: Option<String>,
    pub workspace_dirty: bool,
    pub stage: WorkflowStage,
    pub created_at: DateTime<Utc>,
}

pub type StatusCounts = BTreeMap<JobStatus, u64>;
