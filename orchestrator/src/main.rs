mod config;
mod database;
mod manager;
mod planner;
mod provenance;
mod retry;
mod scheduler;

use crate::{
    config::{registry::ConfigRegistry, ConfigErrors},
    database::JobStatus,
    manager::{ManagerError, ProductionManager},
    planner::PlanningError,
    provenance::GitTagger,
    scheduler::SlurmScheduler,
};
use clap::{Parser, Subcommand};
use std::{error::Error, path::PathBuf, process::ExitCode, time::Duration};
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Batch production orchestrator for mock catalog generation on shared
/// clusters.
#[derive(Debug, Parser)]
#[command(name = "covprod", version, about, long_about = None)]
struct Cli {
    /// Machine whose defaults to resolve against.
    #[arg(long, global = true, env = "COVPROD_MACHINE", default_value = "nersc")]
    machine: String,

    /// Root of the configuration tree (defaults/ and productions/).
    #[arg(long, global = true, env = "COVPROD_CONFIG_ROOT", default_value = "config")]
    config_root: PathBuf,

    /// Override the production's work directory.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan a production and persist its job ledger.
    Init {
        /// Production name, registry key, or path to a declaration file.
        production: String,
        /// Re-plan even if the stored configuration hash differs.
        #[arg(long)]
        force: bool,
        /// Do not warn when the workspace has uncommitted changes.
        #[arg(long)]
        allow_dirty: bool,
    },
    /// Render submission scripts for unsubmitted batches.
    Stage {
        production: String,
        /// Re-render scripts that already exist.
        #[arg(long)]
        force: bool,
    },
    /// Submit staged batches to the scheduler.
    Submit { production: String },
    /// Reconcile job state against the scheduler until the queue drains.
    Monitor {
        production: String,
        /// Seconds between reconciliation passes.
        #[arg(long, default_value_t = 300)]
        interval: u64,
        /// Run a single reconciliation pass and exit.
        #[arg(long)]
        once: bool,
    },
    /// Show job counts and overall progress.
    Status {
        production: String,
        /// Also print per-batch progress.
        #[arg(long)]
        verbose: bool,
    },
    /// Flip retry-eligible failed jobs back to pending.
    Retry {
        production: String,
        /// Stage and submit the retry batches immediately.
        #[arg(long)]
        submit: bool,
    },
    /// Cancel one batch, locally and on the scheduler.
    Cancel {
        production: String,
        batch_id: String,
    },
    /// List the productions the registry knows about.
    List,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("{failed} batch submission(s) failed permanently")]
    Submission { failed: usize },
}

impl CliError {
    /// Stable exit codes so wrapper scripts can branch on the failure
    /// class: 2 configuration, 3 planning, 4 scheduler, 1 anything else.
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) | CliError::Manager(ManagerError::ConfigDrift { .. }) => 2,
            CliError::Manager(ManagerError::Planning(_)) => 3,
            CliError::Manager(ManagerError::Scheduler(_)) | CliError::Submission { .. } => 4,
            CliError::Manager(_) => 1,
        }
    }
}

fn open_manager(cli: &Cli, production: &str) -> Result<ProductionManager<SlurmScheduler>, CliError> {
    let registry = ConfigRegistry::scan(&cli.config_root);
    let declaration = registry.resolve(production)?;
    let config = config::load_production_config(&cli.config_root, &cli.machine, &declaration)?;

    Ok(ProductionManager::open(
        config,
        SlurmScheduler::new(&cli.machine),
        cli.work_dir.clone(),
    )?)
}

fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Init {
            production,
            force,
            allow_dirty,
        } => {
            let manager = open_manager(cli, production)?;
            let report = manager.init(&GitTagger, *force, *allow_dirty)?;

            println!(
                "planned {} jobs ({} new) under {}",
                report.total_jobs,
                report.jobs_created,
                manager.layout().work_dir.display()
            );
        }
        Command::Stage { production, force } => {
            let manager = open_manager(cli, production)?;
            let staged = manager.stage(*force)?;

            println!("staged {} batch(es)", staged.len());
        }
        Command::Submit { production } => {
            let manager = open_manager(cli, production)?;
            let report = manager.submit()?;

            println!(
                "submitted {} batch(es), {} deferred",
                report.submitted.len(),
                report.transient_failures
            );

            if !report.permanent_failures.is_empty() {
                for (batch_id, message) in &report.permanent_failures {
                    eprintln!("  {batch_id}: {message}");
                }

                return Err(CliError::Submission {
                    failed: report.permanent_failures.len(),
                });
            }
        }
        Command::Monitor {
            production,
            interval,
            once,
        } => {
            let manager = open_manager(cli, production)?;
            let counts = manager.monitor_loop(Duration::from_secs(*interval), *once)?;

            print_counts(&counts);
        }
        Command::Status {
            production,
            verbose,
        } => {
            let manager = open_manager(cli, production)?;
            let summary = manager.summary()?;

            println!(
                "{} {} ({})",
                summary.name,
                summary.version,
                summary.work_dir.display()
            );
            if let Some(stage) = summary.stage {
                println!("stage: {stage}");
            }
            println!(
                "{} jobs, {:.1}% complete",
                summary.total_jobs,
                summary.success_rate * 100.0
            );
            print_counts(&summary.counts);

            if *verbose {
                for batch in &summary.batches {
                    let state = match batch.external_handle {
                        Some(handle) => format!("handle {handle}"),
                        None if batch.staged => "staged".to_owned(),
                        None => "planned".to_owned(),
                    };
                    println!(
                        "  {}: {} [{}/{} completed, {} failed]",
                        batch.id,
                        state,
                        batch.counts[&JobStatus::Completed],
                        batch.counts.values().sum::<u64>(),
                        batch.counts[&JobStatus::Failed],
                    );
                }
            }
        }
        Command::Retry { production, submit } => {
            let manager = open_manager(cli, production)?;
            let retried = manager.retry_eligible(chrono::Utc::now())?;

            if *submit && retried > 0 {
                let staged = manager.stage(false)?;
                let report = manager.submit()?;

                println!(
                    "retrying {retried} job(s): staged {} batch(es), submitted {}",
                    staged.len(),
                    report.submitted.len()
                );
            } else {
                println!("marked {retried} job(s) for retry; stage and submit to relaunch them");
            }
        }
        Command::Cancel {
            production,
            batch_id,
        } => {
            let manager = open_manager(cli, production)?;
            let cancelled = manager.cancel_batch(batch_id)?;

            println!("cancelled {cancelled} job(s) in {batch_id}");
        }
        Command::List => {
            let registry = ConfigRegistry::scan(&cli.config_root);

            for (key, path) in registry.entries() {
                println!("{key}\t{}", path.display());
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");

            let mut source = err.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::from(err.exit_code())
        }
    }
}

fn print_counts(counts: &database::StatusCounts) {
    let line = counts
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect::<Vec<_>>()
        .join(" ");

    println!("{line}");
}
