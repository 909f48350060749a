use crate::config::{DirectoryStructure, ProductionConfig};
use itertools::Itertools;
use std::path::PathBuf;
use thiserror::Error;

/// Guard against a misconfigured cross product silently asking for millions
/// of jobs.
pub const MAX_JOBS: usize = 100_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanningError {
    #[error("planned job count is zero, nothing to do")]
    Empty,
    #[error("planned job count {0} exceeds the safety ceiling of {MAX_JOBS}")]
    TooManyJobs(usize),
    #[error("realization {start} + {index} * {step} overflows the index range")]
    RealizationOverflow { start: u32, step: u32, index: u32 },
}

/// One planned unit of work before it is persisted. `output_path` is
/// relative to the production's catalogs directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedJob {
    pub id: String,
    pub realization: u32,
    pub redshift: f64,
    pub batch_id: String,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBatch {
    pub id: String,
    pub job_ids: Vec<String>,
}

/// Stable job identifier: a pure function of realization and redshift, so
/// re-planning the same config always reproduces the same identifiers.
pub fn job_id(realization: u32, redshift: f64) -> String {
    format!("r{realization:04}_z{redshift:.3}")
}

fn output_relpath(structure: DirectoryStructure, realization: u32, redshift: f64) -> PathBuf {
    match structure {
        DirectoryStructure::Hierarchical => {
            PathBuf::from(format!("r{realization:04}")).join(format!("mock_z{redshift:.3}.hdf5"))
        }
        DirectoryStructure::Flat => {
            PathBuf::from(format!("mock_r{realization:04}_z{redshift:.3}.hdf5"))
        }
    }
}

/// Expand the realization x redshift cross product into ordered job specs
/// and slice them into consecutive batches.
///
/// Expansion order is realization-major, redshift-minor and must stay that
/// way: batch membership is derived from it, and job identifiers persisted
/// by a previous init are only reproducible while the order is stable.
pub fn plan(config: &ProductionConfig) -> Result<(Vec<PlannedJob>, Vec<PlannedBatch>), PlanningError> {
    let realizations = &config.science.realizations;
    let redshifts = &config.science.redshifts;

    let job_count = realizations.count as usize * redshifts.len();
    if job_count == 0 {
        return Err(PlanningError::Empty);
    }
    if job_count > MAX_JOBS {
        return Err(PlanningError::TooManyJobs(job_count));
    }

    let mut jobs = Vec::with_capacity(job_count);

    for index in 0..realizations.count {
        let realization = index
            .checked_mul(realizations.step)
            .and_then(|offset| realizations.start.checked_add(offset))
            .ok_or(PlanningError::RealizationOverflow {
                start: realizations.start,
                step: realizations.step,
                index,
            })?;

        for &redshift in redshifts {
            jobs.push(PlannedJob {
                id: job_id(realization, redshift),
                realization,
                redshift,
                batch_id: String::new(),
                output_path: output_relpath(config.outputs.structure, realization, redshift),
            });
        }
    }

    let batches = jobs
        .iter_mut()
        .chunks(config.execution.batch_size)
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let batch_id = format!("batch_{index:04}");
            let mut job_ids = Vec::new();

            for job in chunk {
                job.batch_id = batch_id.clone();
                job_ids.push(job.id.clone());
            }

            PlannedBatch {
                id: batch_id,
                job_ids,
            }
        })
        .collect_vec();

    Ok((jobs, batches))
}
