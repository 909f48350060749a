use crate::{
    config::ProductionConfig,
    database::{
        JobSpec, JobStatus, ProductionMeta, SharedConnection, StatusCounts, StoreError,
        WorkflowStage,
    },
    planner::{self, PlanningError},
    provenance::ProvenanceTagger,
    scheduler::{ExternalStatus, Scheduler, SchedulerError},
};
use chrono::{DateTime, Utc};
use std::{fs, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("filesystem operation failed")]
    Io(#[from] std::io::Error),
    #[error("failed to snapshot the resolved configuration")]
    Snapshot(#[from] serde_yaml::Error),
    #[error(
        "production '{name}' is already initialized with a different configuration \
         (stored hash {stored}, resolved hash {current}); re-run init with --force to re-plan"
    )]
    ConfigDrift {
        name: String,
        stored: String,
        current: String,
    },
}

/// On-disk layout of one production under its work directory.
#[derive(Debug, Clone)]
pub struct ProductionLayout {
    pub work_dir: PathBuf,
    pub catalogs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub qa_dir: PathBuf,
}

impl ProductionLayout {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            catalogs_dir: work_dir.join("catalogs"),
            logs_dir: work_dir.join("logs"),
            metadata_dir: work_dir.join("metadata"),
            qa_dir: work_dir.join("qa"),
            work_dir,
        }
    }

    pub fn create(&self) -> std::io::Result<()> {
        for dir in [
            &self.work_dir,
            &self.catalogs_dir,
            &self.logs_dir,
            &self.metadata_dir,
            &self.qa_dir,
        ] {
            fs::create_dir_all(dir)?;
        }

        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.work_dir.join("production.db")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    pub jobs_created: usize,
    pub total_jobs: usize,
}

#[derive(Debug, Default)]
pub struct SubmitReport {
    pub submitted: Vec<String>,
    pub transient_failures: usize,
    pub permanent_failures: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct MonitorReport {
    pub counts: StatusCounts,
    pub retried: usize,
}

#[derive(Debug)]
pub struct BatchSummary {
    pub id: String,
    pub staged: bool,
    pub external_handle: Option<i64>,
    pub counts: StatusCounts,
}

#[derive(Debug)]
pub struct ProductionSummary {
    pub name: String,
    pub version: String,
    pub work_dir: PathBuf,
    pub stage: Option<WorkflowStage>,
    pub total_jobs: u64,
    pub success_rate: f64,
    pub counts: StatusCounts,
    pub batches: Vec<BatchSummary>,
}

/// Orchestrates the init -> stage -> submit workflow and the monitor/retry
/// loop over the shared job store.
///
/// Every operation is independently invocable and idempotent; concurrent
/// invocations are serialized per mutation by the store's conditional
/// transitions, so a lost race shows up as a debug-logged no-op here,
/// never as corrupted state.
pub struct ProductionManager<S: Scheduler> {
    config: ProductionConfig,
    layout: ProductionLayout,
    store: SharedConnection,
    scheduler: S,
}

impl<S: Scheduler> ProductionManager<S> {
    pub fn open(
        config: ProductionConfig,
        scheduler: S,
        work_dir: Option<PathBuf>,
    ) -> Result<Self, ManagerError> {
        let layout = ProductionLayout::new(work_dir.unwrap_or_else(|| config.work_dir()));
        layout.create()?;

        let store = SharedConnection::open(&layout.db_path())?;
        store.init_schema()?;

        Ok(Self {
            config,
            layout,
            store,
            scheduler,
        })
    }

    pub fn config(&self) -> &ProductionConfig {
        &self.config
    }

    pub fn layout(&self) -> &ProductionLayout {
        &self.layout
    }

    /// Plan the production and persist it. Re-running on an unchanged
    /// config is a no-op beyond re-validation; a changed config is refused
    /// unless forced, because already-persisted job identifiers may no
    /// longer correspond to the new plan.
    pub fn init(
        &self,
        tagger: &dyn ProvenanceTagger,
        force: bool,
        allow_dirty: bool,
    ) -> Result<InitReport, ManagerError> {
        let config_hash = self.config.hash();
        let existing = self.store.meta()?;

        if let Some(meta) = &existing {
            if meta.config_hash != config_hash {
                if !force {
                    return Err(ManagerError::ConfigDrift {
                        name: self.config.production.name.clone(),
                        stored: meta.config_hash.clone(),
                        current: config_hash,
                    });
                }

                warn!(
                    name = %self.config.production.name,
                    "Re-planning an initialized production; previously persisted jobs may not \
                     correspond to the new plan"
                );
            }
        }

        let snapshot = self.layout.metadata_dir.join("production_config.yaml");
        fs::write(&snapshot, serde_yaml::to_string(&self.config)?)?;

        let (jobs, batches) = planner::plan(&self.config)?;
        let now = Utc::now();

        let specs: Vec<JobSpec> = jobs
            .into_iter()
            .map(|job| JobSpec {
                output_path: self.layout.catalogs_dir.join(&job.output_path),
                id: job.id,
                realization: job.realization,
                redshift: job.redshift,
                batch_id: job.batch_id,
                status: JobStatus::Pending,
                attempt_count: 0,
                external_handle: None,
                created_at: now,
                updated_at: now,
                last_error: None,
            })
            .collect();

        // the payload contract expects the artifact directories to exist
        for spec in &specs {
            if let Some(parent) = spec.output_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let jobs_created = self.store.insert_jobs_if_absent(&specs)?;
        for batch in &batches {
            self.store.insert_batch_if_absent(&batch.id)?;
        }

        let meta = ProductionMeta {
            name: self.config.production.name.clone(),
            version: self.config.production.version.clone(),
            config_hash,
            provenance_tag: existing.as_ref().and_then(|meta| meta.provenance_tag.clone()),
            workspace_dirty: existing.as_ref().map(|meta| meta.workspace_dirty).unwrap_or(false),
            stage: existing
                .as_ref()
                .map(|meta| meta.stage)
                .unwrap_or(WorkflowStage::Initialized),
            created_at: existing.map(|meta| meta.created_at).unwrap_or(now),
        };
        self.store.put_meta(&meta)?;

        match tagger.tag(&self.config.production.name, &self.config.production.version) {
            Ok(provenance) => {
                if provenance.dirty && !allow_dirty {
                    warn!(
                        tag = %provenance.tag,
                        "Workspace has uncommitted changes; this production is not \
                         reproducible from its provenance tag"
                    );
                }

                self.store
                    .set_provenance(Some(&provenance.tag), provenance.dirty)?;
            }
            Err(error) => warn!("No provenance tag recorded: {error}"),
        }

        info!(
            name = %self.config.production.name,
            created = jobs_created,
            total = specs.len(),
            "Initialized production"
        );

        Ok(InitReport {
            jobs_created,
            total_jobs: specs.len(),
        })
    }

    /// Render a submission script for every batch that does not have one.
    /// Existing scripts are left alone unless forced, so an operator can
    /// inspect them before they touch the cluster.
    pub fn stage(&self, force: bool) -> Result<Vec<String>, ManagerError> {
        self.adopt_orphaned_pending()?;

        let mut staged = Vec::new();

        for batch in self.store.batches()? {
            if batch.external_handle.is_some() {
                // submitted batches are frozen
                continue;
            }
            if batch.script_path.is_some() && !force {
                continue;
            }

            let jobs = self.store.jobs_in_batch(&batch.id)?;
            if jobs.is_empty() {
                continue;
            }

            let script =
                self.scheduler
                    .render_script(&batch.id, &jobs, &self.config, &self.layout.logs_dir)?;
            self.store.set_batch_script(&batch.id, &script)?;

            info!(batch_id = %batch.id, jobs = jobs.len(), script = ?script, "Staged batch");
            staged.push(batch.id);
        }

        if !staged.is_empty() {
            self.store.set_stage(WorkflowStage::Staged)?;
        }

        Ok(staged)
    }

    /// PENDING jobs whose batch has already been submitted are retry
    /// survivors; regroup them into fresh retry batches so the next
    /// stage/submit pass picks them up.
    fn adopt_orphaned_pending(&self) -> Result<(), ManagerError> {
        let mut orphans = Vec::new();

        for job in self.store.jobs_by_status(JobStatus::Pending)? {
            let batch = self.store.batch(&job.batch_id)?;
            if batch.external_handle.is_some() {
                orphans.push(job.id);
            }
        }

        if orphans.is_empty() {
            return Ok(());
        }

        let retry_index = self
            .store
            .batches()?
            .iter()
            .filter(|batch| batch.id.starts_with("batch_retry_"))
            .count();

        for (offset, chunk) in orphans.chunks(self.config.execution.batch_size).enumerate() {
            let batch_id = format!("batch_retry_{:04}", retry_index + offset);

            self.store.insert_batch_if_absent(&batch_id)?;
            self.store.reassign_batch(chunk, &batch_id)?;

            info!(batch_id = %batch_id, jobs = chunk.len(), "Regrouped retry jobs");
        }

        Ok(())
    }

    /// Submit every staged-but-unsubmitted batch. Transient scheduler
    /// failures leave the batch staged for a later submit pass and consume
    /// no retry budget; permanent ones are surfaced per batch.
    pub fn submit(&self) -> Result<SubmitReport, ManagerError> {
        let mut report = SubmitReport::default();

        for batch in self.store.batches()? {
            let Some(script) = &batch.script_path else {
                continue;
            };
            if batch.external_handle.is_some() {
                continue;
            }

            match self.scheduler.submit(script) {
                Ok(handle) => {
                    self.store.set_batch_handle(&batch.id, handle)?;

                    for job in self.store.jobs_in_batch(&batch.id)? {
                        if job.status == JobStatus::Pending {
                            self.try_transition(&job.id, JobStatus::Pending, JobStatus::Queued)?;
                        }
                    }

                    info!(batch_id = %batch.id, handle = handle, "Submitted batch");
                    report.submitted.push(batch.id);
                }
                Err(error) if error.is_transient() => {
                    warn!(
                        batch_id = %batch.id,
                        "Transient submission failure, batch left staged: {error}"
                    );
                    report.transient_failures += 1;
                }
                Err(error) => {
                    error!(batch_id = %batch.id, "Permanent submission failure: {error}");
                    report.permanent_failures.push((batch.id, error.to_string()));
                }
            }
        }

        if !report.submitted.is_empty() {
            self.store.set_stage(WorkflowStage::Submitted)?;
        }

        Ok(report)
    }

    /// One reconciliation pass: pull scheduler status for every live batch,
    /// fold it into per-job transitions, then flip retry-eligible failures
    /// back to PENDING once their backoff delay has elapsed.
    pub fn monitor_pass(&self, now: DateTime<Utc>) -> Result<MonitorReport, ManagerError> {
        for batch in self.store.batches()? {
            let Some(handle) = batch.external_handle else {
                continue;
            };

            let jobs = self.store.jobs_in_batch(&batch.id)?;
            let active: Vec<_> = jobs
                .iter()
                .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::Running))
                .collect();
            if active.is_empty() {
                continue;
            }

            let external = match self.scheduler.query(handle) {
                Ok(status) => status,
                Err(error) => {
                    warn!(batch_id = %batch.id, handle = handle, "Status query failed: {error}");
                    continue;
                }
            };

            for job in active {
                self.reconcile(job, external)?;
            }
        }

        let retried = self.retry_eligible(now)?;

        Ok(MonitorReport {
            counts: self.store.status_counts()?,
            retried,
        })
    }

    /// Reconcile one job against the batch status the scheduler reported.
    /// The output artifact is the authoritative completion signal; the
    /// scheduler's verdict is advisory except for FAILED, which wins even
    /// over an existing artifact because a partial write is
    /// indistinguishable from a complete one without an integrity marker.
    fn reconcile(&self, job: &JobSpec, external: ExternalStatus) -> Result<(), ManagerError> {
        if external == ExternalStatus::Failed {
            return self.try_fail(job, "scheduler reported batch failure");
        }

        if job.output_path.exists() {
            if job.status == JobStatus::Queued {
                self.try_transition(&job.id, JobStatus::Queued, JobStatus::Running)?;
            }

            return self.try_transition(&job.id, JobStatus::Running, JobStatus::Completed);
        }

        match external {
            ExternalStatus::Running if job.status == JobStatus::Queued => {
                self.try_transition(&job.id, JobStatus::Queued, JobStatus::Running)
            }
            ExternalStatus::Completed => self.try_fail(
                job,
                "scheduler reported completion but the output artifact is missing",
            ),
            ExternalStatus::Unknown => self.try_fail(
                job,
                "job disappeared from the scheduler queue without output",
            ),
            _ => Ok(()),
        }
    }

    /// Flip FAILED jobs with remaining budget and an elapsed backoff delay
    /// back to PENDING. Returns how many were flipped.
    pub fn retry_eligible(&self, now: DateTime<Utc>) -> Result<usize, ManagerError> {
        let policy = self.config.execution.retry_policy;
        let mut retried = 0;

        for job in self.store.jobs_by_status(JobStatus::Failed)? {
            if !policy.should_retry(job.attempt_count) {
                continue;
            }
            if now < policy.eligible_at(job.attempt_count, job.updated_at) {
                debug!(job_id = %job.id, "Backoff delay has not elapsed yet");
                continue;
            }

            // a partial artifact left by the failed attempt must not pass
            // the next monitor pass's completion check
            if job.output_path.exists() {
                fs::remove_file(&job.output_path)?;
            }

            match self
                .store
                .transition(&job.id, JobStatus::Failed, JobStatus::Pending, None)
            {
                Ok(()) => retried += 1,
                Err(StoreError::InvalidTransition { actual, .. }) => {
                    debug!(job_id = %job.id, actual = %actual, "Lost retry race, skipping");
                }
                Err(error) => return Err(error.into()),
            }
        }

        if retried > 0 {
            info!("Marked {retried} failed jobs for retry");
        }

        Ok(retried)
    }

    /// Monitor continuously until nothing is queued or running anymore.
    /// Jobs that went back to PENDING need another stage/submit pass, which
    /// is the operator's call, so they do not keep the loop alive.
    pub fn monitor_loop(&self, interval: Duration, once: bool) -> Result<StatusCounts, ManagerError> {
        loop {
            let report = self.monitor_pass(Utc::now())?;
            let active = report.counts[&JobStatus::Queued] + report.counts[&JobStatus::Running];

            info!(
                pending = report.counts[&JobStatus::Pending],
                queued = report.counts[&JobStatus::Queued],
                running = report.counts[&JobStatus::Running],
                completed = report.counts[&JobStatus::Completed],
                failed = report.counts[&JobStatus::Failed],
                cancelled = report.counts[&JobStatus::Cancelled],
                "Monitor pass finished"
            );

            if once || active == 0 {
                if report.counts[&JobStatus::Pending] > 0 {
                    info!("Pending jobs are waiting for another stage/submit pass");
                }

                return Ok(report.counts);
            }

            std::thread::sleep(interval);
        }
    }

    /// Cancel one batch. The external cancel is best effort; local state is
    /// authoritative for the orchestration layer, so every non-terminal job
    /// of the batch goes to CANCELLED regardless of what the scheduler
    /// says. Returns how many jobs were cancelled.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<usize, ManagerError> {
        let batch = self.store.batch(batch_id)?;

        if let Some(handle) = batch.external_handle {
            if let Err(error) = self.scheduler.cancel(handle) {
                warn!(batch_id = %batch_id, handle = handle, "Best-effort cancel failed: {error}");
            }
        }

        let mut cancelled = 0;

        for job in self.store.jobs_in_batch(batch_id)? {
            if matches!(
                job.status,
                JobStatus::Pending | JobStatus::Queued | JobStatus::Running
            ) {
                match self
                    .store
                    .transition(&job.id, job.status, JobStatus::Cancelled, None)
                {
                    Ok(()) => cancelled += 1,
                    Err(StoreError::InvalidTransition { .. }) => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }

        info!(batch_id = %batch_id, cancelled = cancelled, "Cancelled batch");

        Ok(cancelled)
    }

    /// Read-only aggregation for status/list output.
    pub fn summary(&self) -> Result<ProductionSummary, ManagerError> {
        let counts = self.store.status_counts()?;
        let total_jobs: u64 = counts.values().sum();
        let completed = counts[&JobStatus::Completed];

        let mut batches = Vec::new();
        for batch in self.store.batches()? {
            let mut batch_counts: StatusCounts = JobStatus::ALL
                .into_iter()
                .map(|status| (status, 0))
                .collect();

            for job in self.store.jobs_in_batch(&batch.id)? {
                *batch_counts.entry(job.status).or_default() += 1;
            }

            batches.push(BatchSummary {
                id: batch.id,
                staged: batch.script_path.is_some(),
                external_handle: batch.external_handle,
                counts: batch_counts,
            });
        }

        Ok(ProductionSummary {
            name: self.config.production.name.clone(),
            version: self.config.production.version.clone(),
            work_dir: self.layout.work_dir.clone(),
            stage: self.store.meta()?.map(|meta| meta.stage),
            total_jobs,
            success_rate: if total_jobs > 0 {
                completed as f64 / total_jobs as f64
            } else {
                0.0
            },
            counts,
            batches,
        })
    }

    /// Apply a conditional transition, treating a lost race as a no-op.
    fn try_transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<(), ManagerError> {
        match self.store.transition(job_id, expected, next, None) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidTransition { actual, .. }) => {
                debug!(job_id = %job_id, expected = %expected, actual = %actual, "Lost transition race, skipping");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn try_fail(&self, job: &JobSpec, message: &str) -> Result<(), ManagerError> {
        match self.store.fail_job(&job.id, job.status, message) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidTransition { actual, .. }) => {
                debug!(job_id = %job.id, actual = %actual, "Lost failure race, skipping");
                Ok(())
            }
            Err(StoreError::IllegalTransition { .. }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
