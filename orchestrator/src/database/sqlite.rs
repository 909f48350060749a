use super::{
    BatchSpec, JobSpec, JobStatus, ProductionMeta, StatusCounts, StoreError, WorkflowStage,
};
use chrono::{DateTime, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, types::Type, Connection, Row};
use std::{path::Path, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info};

/// Transparent, thread safe wrapper over `InnerConnection`.
///
/// Multiple CLI invocations and the monitor loop may hold clones of this at
/// once; the fair mutex serializes them, and every status mutation carries
/// an expected-prior-status check so the loser of a race gets an
/// `InvalidTransition` instead of silently overwriting fresher state.
#[derive(Debug, Clone)]
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

#[derive(Debug, Error)]
#[error("unrecognized value '{0}' in job store")]
struct BadEnum(String);

pub const SQL_SCHEMA: [&str; 6] = [
    "create table if not exists jobs (
    id text primary key,
    realization integer not null,
    redshift real not null,
    batch_id text not null,
    output_path text not null,
    status text not null,
    attempt_count integer not null default 0,
    external_handle integer,
    created_at text not null,
    updated_at text not null,
    last_error text
);",
    "create index if not exists idx_jobs_status on jobs (status);",
    "create index if not exists idx_jobs_batch on jobs (batch_id);",
    "create table if not exists batches (
    id text primary key,
    script_path text,
    external_handle integer,
    created_at text not null,
    submitted_at text
);",
    "create index if not exists idx_batches_handle on batches (external_handle);",
    "create table if not exists production_meta (
    id integer primary key check (id = 1),
    name text not null,
    version text not null,
    config_hash text not null,
    provenance_tag text,
    workspace_dirty integer not null default 0,
    stage text not null,
    created_at text not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

const JOB_COLUMNS: &str = "id, realization, redshift, batch_id, output_path, status, \
                           attempt_count, external_handle, created_at, updated_at, last_error";

fn parse_timestamp(index: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

fn row_to_job(row: &Row) -> rusqlite::Result<JobSpec> {
    let status: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(JobSpec {
        id: row.get(0)?,
        realization: row.get(1)?,
        redshift: row.get(2)?,
        batch_id: row.get(3)?,
        output_path: PathBuf::from(row.get::<_, String>(4)?),
        status: JobStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(BadEnum(status)))
        })?,
        attempt_count: row.get(6)?,
        external_handle: row.get(7)?,
        created_at: parse_timestamp(8, created_at)?,
        updated_at: parse_timestamp(9, updated_at)?,
        last_error: row.get(10)?,
    })
}

fn row_to_batch(row: &Row) -> rusqlite::Result<BatchSpec> {
    let created_at: String = row.get(3)?;
    let submitted_at: Option<String> = row.get(4)?;

    Ok(BatchSpec {
        id: row.get(0)?,
        script_path: row.get::<_, Option<String>>(1)?.map(PathBuf::from),
        external_handle: row.get(2)?,
        created_at: parse_timestamp(3, created_at)?,
        submitted_at: submitted_at.map(|ts| parse_timestamp(4, ts)).transpose()?,
    })
}

impl SharedConnection {
    fn new(inner: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        connection.pragma_update(None, "journal_mode", "wal")?;
        connection.pragma_update(None, "foreign_keys", "on")?;

        Ok(Self::new(InnerConnection { connection }))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()?;

        Ok(Self::new(InnerConnection { connection }))
    }

    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.lock().init_schema()
    }

    pub fn meta(&self) -> Result<Option<ProductionMeta>, StoreError> {
        self.lock().meta()
    }

    pub fn put_meta(&self, meta: &ProductionMeta) -> Result<(), StoreError> {
        self.lock().put_meta(meta)
    }

    pub fn set_stage(&self, stage: WorkflowStage) -> Result<(), StoreError> {
        self.lock().set_stage(stage)
    }

    pub fn set_provenance(&self, tag: Option<&str>, dirty: bool) -> Result<(), StoreError> {
        self.lock().set_provenance(tag, dirty)
    }

    pub fn insert_jobs_if_absent(&self, jobs: &[JobSpec]) -> Result<usize, StoreError> {
        self.lock().insert_jobs_if_absent(jobs)
    }

    pub fn insert_batch_if_absent(&self, batch_id: &str) -> Result<bool, StoreError> {
        self.lock().insert_batch_if_absent(batch_id)
    }

    pub fn job(&self, job_id: &str) -> Result<JobSpec, StoreError> {
        self.lock().job(job_id)
    }

    pub fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobSpec>, StoreError> {
        self.lock().jobs_by_status(status)
    }

    pub fn jobs_in_batch(&self, batch_id: &str) -> Result<Vec<JobSpec>, StoreError> {
        self.lock().jobs_in_batch(batch_id)
    }

    pub fn reassign_batch(&self, job_ids: &[String], batch_id: &str) -> Result<(), StoreError> {
        self.lock().reassign_batch(job_ids, batch_id)
    }

    /// Atomic conditional status transition.
    ///
    /// Rejects pairs outside the state table up front, then updates the row
    /// only if its current status still equals `expected`. Zero affected
    /// rows means another writer got there first.
    pub fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.lock().transition(job_id, expected, next, last_error)
    }

    /// Mark a job FAILED and bump its attempt count in one statement.
    pub fn fail_job(
        &self,
        job_id: &str,
        expected: JobStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        self.lock().fail_job(job_id, expected, error)
    }

    pub fn batch(&self, batch_id: &str) -> Result<BatchSpec, StoreError> {
        self.lock().batch(batch_id)
    }

    pub fn batches(&self) -> Result<Vec<BatchSpec>, StoreError> {
        self.lock().batches()
    }

    pub fn set_batch_script(&self, batch_id: &str, path: &Path) -> Result<(), StoreError> {
        self.lock().set_batch_script(batch_id, path)
    }

    pub fn set_batch_handle(&self, batch_id: &str, handle: i64) -> Result<(), StoreError> {
        self.lock().set_batch_handle(batch_id, handle)
    }

    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.lock().status_counts()
    }
}

impl InnerConnection {
    pub fn init_schema(&self) -> Result<(), StoreError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(StoreError::Sqlite(error));
                }
            };
        }

        Ok(())
    }

    fn meta(&self) -> Result<Option<ProductionMeta>, StoreError> {
        let mut statement = self.connection.prepare_cached(
            "select name, version, config_hash, provenance_tag, workspace_dirty, stage, created_at
             from production_meta where id = 1",
        )?;
        let mut rows = statement.query([])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let stage: String = row.get(5)?;
        let created_at: String = row.get(6)?;

        Ok(Some(ProductionMeta {
            name: row.get(0)?,
            version: row.get(1)?,
            config_hash: row.get(2)?,
            provenance_tag: row.get(3)?,
            workspace_dirty: row.get(4)?,
            stage: WorkflowStage::parse(&stage).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(BadEnum(stage)))
            })?,
            created_at: parse_timestamp(6, created_at)?,
        }))
    }

    fn put_meta(&self, meta: &ProductionMeta) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(
                "insert or replace into production_meta
                 (id, name, version, config_hash, provenance_tag, workspace_dirty, stage, created_at)
                 values (1, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                meta.name,
                meta.version,
                meta.config_hash,
                meta.provenance_tag,
                meta.workspace_dirty,
                meta.stage.as_str(),
                meta.created_at.to_rfc3339(),
            ])?;

        Ok(())
    }

    fn set_stage(&self, stage: WorkflowStage) -> Result<(), StoreError> {
        let affected = self
            .connection
            .prepare_cached("update production_meta set stage = ? where id = 1")?
            .execute(params![stage.as_str()])?;

        if affected == 0 {
            return Err(StoreError::MissingMeta);
        }

        Ok(())
    }

    fn set_provenance(&self, tag: Option<&str>, dirty: bool) -> Result<(), StoreError> {
        let affected = self
            .connection
            .prepare_cached(
                "update production_meta set provenance_tag = ?, workspace_dirty = ? where id = 1",
            )?
            .execute(params![tag, dirty])?;

        if affected == 0 {
            return Err(StoreError::MissingMeta);
        }

        Ok(())
    }

    fn insert_jobs_if_absent(&self, jobs: &[JobSpec]) -> Result<usize, StoreError> {
        let mut inserted = 0;

        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        for job in jobs {
            inserted += tx
                .prepare_cached(
                    "insert or ignore into jobs
                     (id, realization, redshift, batch_id, output_path, status,
                      attempt_count, external_handle, created_at, updated_at, last_error)
                     values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?
                .execute(params![
                    job.id,
                    job.realization,
                    job.redshift,
                    job.batch_id,
                    job.output_path.to_string_lossy(),
                    job.status.as_str(),
                    job.attempt_count,
                    job.external_handle,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    job.last_error,
                ])?;
        }

        tx.commit()?;

        info!("Inserted {inserted} of {} planned jobs", jobs.len());

        Ok(inserted)
    }

    fn insert_batch_if_absent(&self, batch_id: &str) -> Result<bool, StoreError> {
        let inserted = self
            .connection
            .prepare_cached(
                "insert or ignore into batches (id, created_at) values (?, ?)",
            )?
            .execute(params![batch_id, Utc::now().to_rfc3339()])?;

        Ok(inserted > 0)
    }

    fn job(&self, job_id: &str) -> Result<JobSpec, StoreError> {
        let mut statement = self
            .connection
            .prepare_cached(&format!("select {JOB_COLUMNS} from jobs where id = ?"))?;
        let mut rows = statement.query(params![job_id])?;

        match rows.next()? {
            Some(row) => Ok(row_to_job(row)?),
            None => Err(StoreError::MissingJob(job_id.to_owned())),
        }
    }

    fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobSpec>, StoreError> {
        let jobs = self
            .connection
            .prepare_cached(&format!(
                "select {JOB_COLUMNS} from jobs where status = ? order by id"
            ))?
            .query_map(params![status.as_str()], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(jobs)
    }

    fn jobs_in_batch(&self, batch_id: &str) -> Result<Vec<JobSpec>, StoreError> {
        let jobs = self
            .connection
            .prepare_cached(&format!(
                "select {JOB_COLUMNS} from jobs where batch_id = ? order by id"
            ))?
            .query_map(params![batch_id], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(jobs)
    }

    fn reassign_batch(&self, job_ids: &[String], batch_id: &str) -> Result<(), StoreError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        for job_id in job_ids {
            let affected = tx
                .prepare_cached("update jobs set batch_id = ?, updated_at = ? where id = ?")?
                .execute(params![batch_id, Utc::now().to_rfc3339(), job_id])?;

            if affected == 0 {
                return Err(StoreError::MissingJob(job_id.clone()));
            }
        }

        tx.commit()?;

        Ok(())
    }

    fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: expected,
                to: next,
            });
        }

        let affected = self
            .connection
            .prepare_cached(
                "update jobs set status = ?, updated_at = ?, last_error = ?
                 where id = ? and status = ?",
            )?
            .execute(params![
                next.as_str(),
                Utc::now().to_rfc3339(),
                last_error,
                job_id,
                expected.as_str(),
            ])?;

        if affected == 0 {
            let actual = self.job(job_id)?.status;

            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_owned(),
                expected,
                actual,
            });
        }

        debug!(job_id = %job_id, from = %expected, to = %next, "Transitioned job");

        Ok(())
    }

    fn fail_job(&self, job_id: &str, expected: JobStatus, error: &str) -> Result<(), StoreError> {
        if !expected.can_transition_to(JobStatus::Failed) {
            return Err(StoreError::IllegalTransition {
                from: expected,
                to: JobStatus::Failed,
            });
        }

        let affected = self
            .connection
            .prepare_cached(
                "update jobs set status = 'failed', attempt_count = attempt_count + 1,
                        updated_at = ?, last_error = ?
                 where id = ? and status = ?",
            )?
            .execute(params![
                Utc::now().to_rfc3339(),
                error,
                job_id,
                expected.as_str(),
            ])?;

        if affected == 0 {
            let actual = self.job(job_id)?.status;

            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_owned(),
                expected,
                actual,
            });
        }

        debug!(job_id = %job_id, from = %expected, "Marked job failed: {error}");

        Ok(())
    }

    fn batch(&self, batch_id: &str) -> Result<BatchSpec, StoreError> {
        let mut statement = self.connection.prepare_cached(
            "select id, script_path, external_handle, created_at, submitted_at
             from batches where id = ?",
        )?;
        let mut rows = statement.query(params![batch_id])?;

        match rows.next()? {
            Some(row) => Ok(row_to_batch(row)?),
            None => Err(StoreError::MissingBatch(batch_id.to_owned())),
        }
    }

    fn batches(&self) -> Result<Vec<BatchSpec>, StoreError> {
        let batches = self
            .connection
            .prepare_cached(
                "select id, script_path, external_handle, created_at, submitted_at
                 from batches order by id",
            )?
            .query_map([], row_to_batch)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(batches)
    }

    fn set_batch_script(&self, batch_id: &str, path: &Path) -> Result<(), StoreError> {
        let affected = self
            .connection
            .prepare_cached("update batches set script_path = ? where id = ?")?
            .execute(params![path.to_string_lossy(), batch_id])?;

        if affected == 0 {
            return Err(StoreError::MissingBatch(batch_id.to_owned()));
        }

        Ok(())
    }

    fn set_batch_handle(&self, batch_id: &str, handle: i64) -> Result<(), StoreError> {
        let affected = self
            .connection
            .prepare_cached(
                "update batches set external_handle = ?, submitted_at = ? where id = ?",
            )?
            .execute(params![handle, Utc::now().to_rfc3339(), batch_id])?;

        if affected == 0 {
            return Err(StoreError::MissingBatch(batch_id.to_owned()));
        }

        Ok(())
    }

    fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let mut counts: StatusCounts = JobStatus::ALL
            .into_iter()
            .map(|status| (status, 0))
            .collect();

        let mut statement = self
            .connection
            .prepare_cached("select status, count(*) from jobs group by status")?;
        let mut rows = statement.query([])?;

        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: u64 = row.get(1)?;

            let status = JobStatus::parse(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(BadEnum(status)))
            })?;
            counts.insert(status, count);
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{JobSpec, JobStatus, ProductionMeta, WorkflowStage};
    use proptest::prelude::*;
    use std::sync::Barrier;

    fn sample_job(id: &str, batch_id: &str) -> JobSpec {
        let now = Utc::now();

        JobSpec {
            id: id.to_owned(),
            realization: 0,
            redshift: 1.0,
            batch_id: batch_id.to_owned(),
            output_path: PathBuf::from(format!("catalogs/{id}.hdf5")),
            status: JobStatus::Pending,
            attempt_count: 0,
            external_handle: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    fn store_with_jobs(ids: &[&str]) -> SharedConnection {
        let store = SharedConnection::open_in_memory().unwrap();
        store.init_schema().unwrap();

        let jobs: Vec<_> = ids.iter().map(|id| sample_job(id, "batch_0000")).collect();
        store.insert_jobs_if_absent(&jobs).unwrap();

        store
    }

    #[test]
    fn insert_is_idempotent() {
        let store = SharedConnection::open_in_memory().unwrap();
        store.init_schema().unwrap();

        let jobs = vec![sample_job("r0000_z1.000", "batch_0000"), sample_job("r0001_z1.000", "batch_0000")];

        assert_eq!(store.insert_jobs_if_absent(&jobs).unwrap(), 2);
        assert_eq!(store.insert_jobs_if_absent(&jobs).unwrap(), 0);
        assert_eq!(store.jobs_by_status(JobStatus::Pending).unwrap().len(), 2);
    }

    #[test]
    fn legal_transition_chain() {
        let store = store_with_jobs(&["r0000_z1.000"]);

        store
            .transition("r0000_z1.000", JobStatus::Pending, JobStatus::Queued, None)
            .unwrap();
        store
            .transition("r0000_z1.000", JobStatus::Queued, JobStatus::Running, None)
            .unwrap();
        store
            .transition("r0000_z1.000", JobStatus::Running, JobStatus::Completed, None)
            .unwrap();

        assert_eq!(
            store.job("r0000_z1.000").unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn off_table_transition_is_rejected_before_touching_the_row() {
        let store = store_with_jobs(&["r0000_z1.000"]);

        let result = store.transition("r0000_z1.000", JobStatus::Pending, JobStatus::Completed, None);

        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
        assert_eq!(store.job("r0000_z1.000").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn stale_expected_status_is_rejected_with_actual() {
        let store = store_with_jobs(&["r0000_z1.000"]);

        let result = store.transition("r0000_z1.000", JobStatus::Running, JobStatus::Completed, None);

        match result {
            Err(StoreError::InvalidTransition { expected, actual, .. }) => {
                assert_eq!(expected, JobStatus::Running);
                assert_eq!(actual, JobStatus::Pending);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn fail_job_bumps_attempt_count_atomically() {
        let store = store_with_jobs(&["r0000_z1.000"]);

        store
            .transition("r0000_z1.000", JobStatus::Pending, JobStatus::Queued, None)
            .unwrap();
        store
            .transition("r0000_z1.000", JobStatus::Queued, JobStatus::Running, None)
            .unwrap();
        store
            .fail_job("r0000_z1.000", JobStatus::Running, "walltime exceeded")
            .unwrap();

        let job = store.job("r0000_z1.000").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("walltime exceeded"));
    }

    #[test]
    fn retry_flip_clears_last_error() {
        let store = store_with_jobs(&["r0000_z1.000"]);

        store
            .transition("r0000_z1.000", JobStatus::Pending, JobStatus::Queued, None)
            .unwrap();
        store
            .fail_job("r0000_z1.000", JobStatus::Queued, "node failure")
            .unwrap();
        store
            .transition("r0000_z1.000", JobStatus::Failed, JobStatus::Pending, None)
            .unwrap();

        let job = store.job("r0000_z1.000").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error, None);
        // the spent attempt stays on the record
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn two_actors_one_winner() {
        let store = store_with_jobs(&["r0000_z1.000"]);
        store
            .transition("r0000_z1.000", JobStatus::Pending, JobStatus::Queued, None)
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();

        for _ in 0..2 {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);

            handles.push(std::thread::spawn(move || {
                barrier.wait();
                store.transition("r0000_z1.000", JobStatus::Queued, JobStatus::Running, None)
            }));
        }

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let wins = results.iter().filter(|result| result.is_ok()).count();
        let rejections = results
            .iter()
            .filter(|result| matches!(result, Err(StoreError::InvalidTransition { actual, .. }) if *actual == JobStatus::Running))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(rejections, 1);
        assert_eq!(store.job("r0000_z1.000").unwrap().status, JobStatus::Running);
    }

    #[test]
    fn batch_roundtrip() {
        let store = store_with_jobs(&["r0000_z1.000"]);

        assert!(store.insert_batch_if_absent("batch_0000").unwrap());
        assert!(!store.insert_batch_if_absent("batch_0000").unwrap());

        store
            .set_batch_script("batch_0000", Path::new("logs/batch_0000.sh"))
            .unwrap();
        store.set_batch_handle("batch_0000", 123456).unwrap();

        let batch = store.batch("batch_0000").unwrap();
        assert_eq!(batch.script_path.as_deref(), Some(Path::new("logs/batch_0000.sh")));
        assert_eq!(batch.external_handle, Some(123456));
        assert!(batch.submitted_at.is_some());
    }

    #[test]
    fn reassign_moves_jobs_to_retry_batch() {
        let store = store_with_jobs(&["r0000_z1.000", "r0001_z1.000"]);

        store
            .reassign_batch(&["r0001_z1.000".to_owned()], "batch_retry_0000")
            .unwrap();

        assert_eq!(store.jobs_in_batch("batch_retry_0000").unwrap().len(), 1);
        assert_eq!(store.jobs_in_batch("batch_0000").unwrap().len(), 1);
    }

    #[test]
    fn meta_roundtrip() {
        let store = SharedConnection::open_in_memory().unwrap();
        store.init_schema().unwrap();

        assert!(store.meta().unwrap().is_none());

        let meta = ProductionMeta {
            name: "alpha".to_owned(),
            version: "v1.0".to_owned(),
            config_hash: "deadbeef".to_owned(),
            provenance_tag: None,
            workspace_dirty: false,
            stage: WorkflowStage::Initialized,
            created_at: Utc::now(),
        };
        store.put_meta(&meta).unwrap();

        store.set_provenance(Some("v1.0-3-gabc"), true).unwrap();
        store.set_stage(WorkflowStage::Staged).unwrap();

        let stored = store.meta().unwrap().unwrap();
        assert_eq!(stored.config_hash, "deadbeef");
        assert_eq!(stored.provenance_tag.as_deref(), Some("v1.0-3-gabc"));
        assert!(stored.workspace_dirty);
        assert_eq!(stored.stage, WorkflowStage::Staged);
    }

    #[test]
    fn counts_cover_every_status() {
        let store = store_with_jobs(&["r0000_z1.000", "r0001_z1.000", "r0002_z1.000"]);

        store
            .transition("r0000_z1.000", JobStatus::Pending, JobStatus::Queued, None)
            .unwrap();

        let counts = store.status_counts().unwrap();
        assert_eq!(counts[&JobStatus::Pending], 2);
        assert_eq!(counts[&JobStatus::Queued], 1);
        assert_eq!(counts[&JobStatus::Completed], 0);
        assert_eq!(counts.len(), JobStatus::ALL.len());
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        /// No sequence of transition attempts, however adversarial, can move
        /// a job along an edge outside the state table: the store either
        /// applies a legal edge from the true current state or rejects.
        #[test]
        fn random_interleavings_stay_inside_the_state_table(
            ops in prop::collection::vec((status_strategy(), status_strategy()), 1..40)
        ) {
            let store = store_with_jobs(&["r0000_z1.000"]);
            let mut model = JobStatus::Pending;

            for (expected, next) in ops {
                match store.transition("r0000_z1.000", expected, next, None) {
                    Ok(()) => {
                        prop_assert_eq!(model, expected);
                        prop_assert!(expected.can_transition_to(next));
                        model = next;
                    }
                    Err(StoreError::IllegalTransition { .. }) => {
                        prop_assert!(!expected.can_transition_to(next));
                    }
                    Err(StoreError::InvalidTransition { actual, .. }) => {
                        prop_assert_eq!(actual, model);
                        prop_assert_ne!(model, expected);
                    }
                    Err(error) => return Err(TestCaseError::fail(format!("{error}"))),
                }

                prop_assert_eq!(store.job("r0000_z1.000").unwrap().status, model);
            }
        }
    }
}
