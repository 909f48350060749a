use super::{ExternalStatus, Scheduler, SchedulerError};
use crate::{config::ProductionConfig, database::JobSpec};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::debug;

/// SLURM adapter: renders sbatch scripts and shells out to the usual
/// trio of sbatch/squeue/scancel.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    machine: String,
}

/// stderr fragments that indicate the controller is struggling rather than
/// the submission being wrong
const TRANSIENT_MARKERS: &[&str] = &[
    "socket timed out",
    "unable to contact slurm controller",
    "resources temporarily unavailable",
    "connection refused",
    "slurm_load_jobs error",
    "qosmaxsubmitjobperuserlimit",
];

fn classify(stderr: &str, context: &str) -> SchedulerError {
    let lowered = stderr.to_lowercase();
    let message = format!("{context}: {}", stderr.trim());

    if TRANSIENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        SchedulerError::Transient(message)
    } else {
        SchedulerError::Permanent(message)
    }
}

fn parse_sbatch_output(stdout: &str) -> Option<i64> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Submitted batch job ")
            .and_then(|id| id.trim().parse().ok())
    })
}

fn map_state(state: &str) -> ExternalStatus {
    match state {
        "PENDING" | "CONFIGURING" | "SUSPENDED" | "PD" => ExternalStatus::Queued,
        "RUNNING" | "COMPLETING" | "R" | "CG" => ExternalStatus::Running,
        "COMPLETED" | "CD" => ExternalStatus::Completed,
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "CANCELLED" | "PREEMPTED"
        | "F" | "TO" | "OOM" | "NF" | "CA" => ExternalStatus::Failed,
        _ => ExternalStatus::Unknown,
    }
}

/// An array job reports one queue row per task; the batch is as alive as
/// its most active member.
fn aggregate_states<'a>(states: impl Iterator<Item = &'a str>) -> ExternalStatus {
    let mut aggregate = ExternalStatus::Unknown;

    for state in states {
        let status = map_state(state);

        aggregate = match (aggregate, status) {
            (_, ExternalStatus::Running) | (ExternalStatus::Running, _) => ExternalStatus::Running,
            (_, ExternalStatus::Queued) | (ExternalStatus::Queued, _) => ExternalStatus::Queued,
            (_, ExternalStatus::Failed) | (ExternalStatus::Failed, _) => ExternalStatus::Failed,
            (_, ExternalStatus::Completed) | (ExternalStatus::Completed, _) => {
                ExternalStatus::Completed
            }
            (ExternalStatus::Unknown, ExternalStatus::Unknown) => ExternalStatus::Unknown,
        };
    }

    aggregate
}

impl SlurmScheduler {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
        }
    }

    fn sbatch_header(
        &self,
        batch_id: &str,
        config: &ProductionConfig,
        logs_dir: &Path,
        array_len: Option<usize>,
    ) -> String {
        let resources = &config.resources;
        let minutes = (config.execution.timeout_hours * 60.0).round() as u64;
        let logs = logs_dir.display();

        let mut header = format!(
            "#!/bin/bash\n\
             #SBATCH --job-name={batch_id}\n\
             #SBATCH --account={}\n\
             #SBATCH --partition={}\n",
            resources.account, resources.partition
        );

        if let Some(constraint) = &resources.constraint {
            header.push_str(&format!("#SBATCH --constraint={constraint}\n"));
        }

        header.push_str(&format!(
            "#SBATCH --nodes={}\n\
             #SBATCH --ntasks-per-node={}\n\
             #SBATCH --cpus-per-task={}\n",
            resources.nodes_per_job, resources.tasks_per_node, resources.cpus_per_task
        ));

        if resources.gpus_per_node > 0 {
            header.push_str(&format!(
                "#SBATCH --gpus-per-node={}\n",
                resources.gpus_per_node
            ));
        }
        if let Some(memory_gb) = resources.memory_gb {
            header.push_str(&format!("#SBATCH --mem={memory_gb}G\n"));
        }

        header.push_str(&format!("#SBATCH --time={minutes}:00\n"));

        match array_len {
            Some(len) => header.push_str(&format!(
                "#SBATCH --array=0-{}\n\
                 #SBATCH --output={logs}/{batch_id}_%a.out\n\
                 #SBATCH --error={logs}/{batch_id}_%a.err\n",
                len - 1
            )),
            None => header.push_str(&format!(
                "#SBATCH --output={logs}/{batch_id}.out\n\
                 #SBATCH --error={logs}/{batch_id}.err\n"
            )),
        }

        header
    }

    fn render_single(&self, batch_id: &str, job: &JobSpec, config: &ProductionConfig, logs_dir: &Path) -> String {
        let header = self.sbatch_header(batch_id, config, logs_dir, None);
        let payload = config.execution.payload.display();
        let tasks = config.resources.nodes_per_job * config.resources.tasks_per_node;

        format!(
            "{header}\n\
             echo \"Starting job {id}: realization {realization}, redshift {redshift}\"\n\n\
             srun --ntasks={tasks} {payload} {machine} \\\n\
             \x20   \"{output}\" \\\n\
             \x20   --realization \"{realization}\" \\\n\
             \x20   --redshift \"{redshift}\"\n\n\
             EXIT_CODE=$?\n\n\
             echo \"Job {id} completed with exit code $EXIT_CODE\"\n\
             exit $EXIT_CODE\n",
            id = job.id,
            realization = job.realization,
            redshift = job.redshift,
            machine = self.machine,
            output = job.output_path.display(),
        )
    }

    fn render_array(&self, batch_id: &str, jobs: &[JobSpec], config: &ProductionConfig, logs_dir: &Path) -> String {
        let header = self.sbatch_header(batch_id, config, logs_dir, Some(jobs.len()));
        let payload = config.execution.payload.display();

        let mut script = format!("{header}\n# Job array mapping\ndeclare -a JOB_IDS=(\n");
        for job in jobs {
            script.push_str(&format!("    \"{}\"\n", job.id));
        }

        script.push_str(")\n\ndeclare -a REALIZATIONS=(\n");
        for job in jobs {
            script.push_str(&format!("    \"{}\"\n", job.realization));
        }

        script.push_str(")\n\ndeclare -a REDSHIFTS=(\n");
        for job in jobs {
            script.push_str(&format!("    \"{}\"\n", job.redshift));
        }

        script.push_str(")\n\ndeclare -a OUTPUT_PATHS=(\n");
        for job in jobs {
            script.push_str(&format!("    \"{}\"\n", job.output_path.display()));
        }

        script.push_str(&format!(
            ")\n\n\
             JOB_ID=\"${{JOB_IDS[$SLURM_ARRAY_TASK_ID]}}\"\n\
             REALIZATION=\"${{REALIZATIONS[$SLURM_ARRAY_TASK_ID]}}\"\n\
             REDSHIFT=\"${{REDSHIFTS[$SLURM_ARRAY_TASK_ID]}}\"\n\
             OUTPUT_PATH=\"${{OUTPUT_PATHS[$SLURM_ARRAY_TASK_ID]}}\"\n\n\
             echo \"Starting job $JOB_ID: realization $REALIZATION, redshift $REDSHIFT\"\n\n\
             {payload} {machine} \\\n\
             \x20   \"$OUTPUT_PATH\" \\\n\
             \x20   --realization \"$REALIZATION\" \\\n\
             \x20   --redshift \"$REDSHIFT\"\n\n\
             EXIT_CODE=$?\n\n\
             echo \"Job $JOB_ID completed with exit code $EXIT_CODE\"\n\
             exit $EXIT_CODE\n",
            machine = self.machine,
        ));

        script
    }
}

impl Scheduler for SlurmScheduler {
    fn render_script(
        &self,
        batch_id: &str,
        jobs: &[JobSpec],
        config: &ProductionConfig,
        logs_dir: &Path,
    ) -> Result<PathBuf, SchedulerError> {
        let script_path = logs_dir.join(format!("{batch_id}.sh"));

        let content = match jobs {
            [] => {
                return Err(SchedulerError::Permanent(format!(
                    "batch {batch_id} has no jobs to render"
                )))
            }
            [single] => self.render_single(batch_id, single, config, logs_dir),
            _ => self.render_array(batch_id, jobs, config, logs_dir),
        };

        let render_error = |source| SchedulerError::Render {
            path: script_path.clone(),
            source,
        };

        fs::write(&script_path, content).map_err(render_error)?;
        let mut permissions = fs::metadata(&script_path).map_err(render_error)?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&script_path, permissions).map_err(render_error)?;

        debug!(batch_id = %batch_id, path = ?script_path, "Rendered batch script");

        Ok(script_path)
    }

    fn submit(&self, script: &Path) -> Result<i64, SchedulerError> {
        let output = Command::new("sbatch")
            .arg(script)
            .output()
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => {
                    SchedulerError::Permanent("sbatch not found on PATH".to_owned())
                }
                _ => SchedulerError::Transient(format!("failed to invoke sbatch: {error}")),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(&stderr, "sbatch rejected the submission"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_sbatch_output(&stdout).ok_or_else(|| {
            SchedulerError::Permanent(format!(
                "could not parse a job id from sbatch output: {}",
                stdout.trim()
            ))
        })
    }

    fn query(&self, handle: i64) -> Result<ExternalStatus, SchedulerError> {
        let output = Command::new("squeue")
            .args(["-j", &handle.to_string(), "--format=%T", "--noheader"])
            .output()
            .map_err(|error| {
                SchedulerError::Transient(format!("failed to invoke squeue: {error}"))
            })?;

        if !output.status.success() {
            // squeue errors out for handles that have aged out of its
            // history; the monitor falls back to the artifact check
            debug!(handle = handle, "squeue does not know the handle anymore");
            return Ok(ExternalStatus::Unknown);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(aggregate_states(
            stdout.lines().map(str::trim).filter(|line| !line.is_empty()),
        ))
    }

    fn cancel(&self, handle: i64) -> Result<(), SchedulerError> {
        let output = Command::new("scancel")
            .arg(handle.to_string())
            .output()
            .map_err(|error| {
                SchedulerError::Transient(format!("failed to invoke scancel: {error}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(&stderr, "scancel failed"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve;
    use chrono::Utc;
    use serde_yaml::Value;

    fn config() -> ProductionConfig {
        let defaults: Value = serde_yaml::from_str(
            r#"
            resources:
              account: cosmo
              partition: regular
              constraint: gpu
              nodes_per_job: 1
              tasks_per_node: 8
              cpus_per_task: 4
              gpus_per_node: 4
            outputs:
              base_path: /scratch/mocks
            "#,
        )
        .unwrap();
        let declaration: Value = serde_yaml::from_str(
            r#"
            production:
              name: alpha
              version: v1.0
            science:
              cosmology: planck18
              redshifts: [1.0, 1.5]
              realizations:
                start: 0
                count: 2
            execution:
              job_type: gpu-intensive
              batch_size: 4
              timeout_hours: 2.0
              retry_policy:
                max_retries: 3
                backoff_multiplier: 2.0
                initial_delay_minutes: 5.0
              payload: /opt/pipeline/bin/generate_mock
            "#,
        )
        .unwrap();

        resolve(&defaults, &declaration).unwrap()
    }

    fn job(id: &str, realization: u32, redshift: f64) -> JobSpec {
        let now = Utc::now();

        JobSpec {
            id: id.to_owned(),
            realization,
            redshift,
            batch_id: "batch_0000".to_owned(),
            output_path: PathBuf::from(format!("/scratch/mocks/catalogs/{id}.hdf5")),
            status: crate::database::JobStatus::Pending,
            attempt_count: 0,
            external_handle: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    #[test]
    fn parses_sbatch_acknowledgement() {
        assert_eq!(
            parse_sbatch_output("Submitted batch job 4242\n"),
            Some(4242)
        );
        assert_eq!(
            parse_sbatch_output("sbatch: queued\nSubmitted batch job 17"),
            Some(17)
        );
        assert_eq!(parse_sbatch_output("something else entirely"), None);
    }

    #[test]
    fn controller_trouble_is_transient_bad_requests_are_not() {
        assert!(classify(
            "sbatch: error: Socket timed out on send/recv operation",
            "submit"
        )
        .is_transient());
        assert!(classify("Unable to contact slurm controller (connect failure)", "submit").is_transient());
        assert!(!classify("sbatch: error: Invalid account or account/partition combination specified", "submit").is_transient());
        assert!(!classify("sbatch: error: Batch script is empty!", "submit").is_transient());
    }

    #[test]
    fn state_aggregation_prefers_the_most_active_member() {
        assert_eq!(
            aggregate_states(["COMPLETED", "RUNNING", "FAILED"].into_iter()),
            ExternalStatus::Running
        );
        assert_eq!(
            aggregate_states(["COMPLETED", "PENDING"].into_iter()),
            ExternalStatus::Queued
        );
        assert_eq!(
            aggregate_states(["COMPLETED", "FAILED"].into_iter()),
            ExternalStatus::Failed
        );
        assert_eq!(
            aggregate_states(["COMPLETED", "COMPLETED"].into_iter()),
            ExternalStatus::Completed
        );
        assert_eq!(aggregate_states([].into_iter()), ExternalStatus::Unknown);
    }

    #[test]
    fn single_job_script_runs_the_payload_directly() {
        let scheduler = SlurmScheduler::new("nersc");
        let logs = tempfile::tempdir().unwrap();
        let jobs = [job("r0000_z1.000", 0, 1.0)];

        let path = scheduler
            .render_script("batch_0000", &jobs, &config(), logs.path())
            .unwrap();

        let script = fs::read_to_string(&path).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("#SBATCH --account=cosmo"));
        assert!(script.contains("#SBATCH --gpus-per-node=4"));
        assert!(script.contains("#SBATCH --time=120:00"));
        assert!(!script.contains("--array"));
        assert!(script.contains("srun --ntasks=8 /opt/pipeline/bin/generate_mock nersc"));
        assert!(script.contains("--realization \"0\""));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn array_script_maps_tasks_through_bash_arrays() {
        let scheduler = SlurmScheduler::new("nersc");
        let logs = tempfile::tempdir().unwrap();
        let jobs = [
            job("r0000_z1.000", 0, 1.0),
            job("r0000_z1.500", 0, 1.5),
            job("r0001_z1.000", 1, 1.0),
        ];

        let path = scheduler
            .render_script("batch_0001", &jobs, &config(), logs.path())
            .unwrap();

        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains("#SBATCH --array=0-2"));
        assert!(script.contains("#SBATCH --output=") && script.contains("batch_0001_%a.out"));
        assert!(script.contains("\"r0001_z1.000\""));
        assert!(script.contains("${JOB_IDS[$SLURM_ARRAY_TASK_ID]}"));
        assert!(script.contains("--redshift \"$REDSHIFT\""));
    }
}
