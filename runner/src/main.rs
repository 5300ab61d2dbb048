mod binding;
mod checkpoint;
mod clean;
mod config;
mod diagnostics;
mod executors;
mod progress;
mod solver;
mod staging;
mod unit;

#[cfg(test)]
mod progress_test;
#[cfg(test)]
mod unit_test;

use checkpoint::CheckpointError;
use clap::{error::ErrorKind, Parser, Subcommand};
use config::{BatchConfig, ConfigErrors};
use executors::{local::LocalExecutor, Executor, ExecutorError};
use solver::orca::OrcaSolver;
use std::{ops::RangeInclusive, path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use unit::Layout;

/// Run batches of quantum-chemistry single points over a molecule dataset,
/// one pinned worker per slice of the node's cores
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More log output, repeat for trace level. RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML config file, defaults to qmbatch.yaml in the working directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the directory holding one subdirectory per molecule
    #[arg(long, global = true)]
    source_root: Option<PathBuf>,

    /// Override the root of the working area (scratch, aggregation, checkpoint)
    #[arg(long, global = true)]
    work_root: Option<PathBuf>,

    /// Override the solver wall-clock limit in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every pending unit of the molecule id range [start_id, end_id]
    Run {
        start_id: u64,
        end_id: u64,
        /// Number of parallel workers, picked from the core count if omitted
        concurrency: Option<usize>,
    },
    /// Report how many units of the id range are done, changes nothing
    Progress { start_id: u64, end_id: u64 },
    /// Delete everything in the scratch directory
    Clean {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Configuration error")]
    Config(#[from] ConfigErrors),
    #[error("Batch could not run")]
    Executor(#[from] ExecutorError),
    #[error("Failed to read checkpoint")]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to clean scratch directory")]
    Clean(#[source] std::io::Error),
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn id_range(start_id: u64, end_id: u64) -> Result<RangeInclusive<u64>, ConfigErrors> {
    if start_id > end_id {
        return Err(ConfigErrors::InvalidRange {
            start: start_id,
            end: end_id,
        });
    }

    Ok(start_id..=end_id)
}

fn load_config(cli: &Cli) -> Result<BatchConfig, ConfigErrors> {
    let mut config = BatchConfig::load(cli.config.as_deref())?;

    if let Some(ref source_root) = cli.source_root {
        config.source_root = source_root.clone();
    }
    if let Some(ref work_root) = cli.work_root {
        config.work_root = work_root.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.solver.timeout = timeout;
    }

    Ok(config)
}

fn run(
    mut config: BatchConfig,
    ids: RangeInclusive<u64>,
    concurrency: Option<usize>,
) -> Result<(), CliError> {
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let total_cores = config::detect_total_cores();
    let concurrency = concurrency.unwrap_or_else(|| config::default_concurrency(total_cores));

    info!(
        "Batch {}..={} with {concurrency} workers on {total_cores} cores",
        ids.start(),
        ids.end()
    );

    let solver = OrcaSolver::from_config(&config);
    let mut executor = LocalExecutor::load(config, solver, total_cores)?;
    let report = executor.execute(ids, concurrency)?;

    if report.failed > 0 {
        error!("{} units failed, they stay pending for the next run", report.failed);
    }

    Ok(())
}

fn progress(config: BatchConfig, ids: RangeInclusive<u64>) -> Result<(), CliError> {
    let layout = Layout::from_config(&config);
    let checkpoint = checkpoint::load(&config.checkpoint_path())?;
    let progress = progress::report(&layout, &ids, &checkpoint);

    println!("{progress}");

    Ok(())
}

fn dispatch(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;

    match cli.command {
        Commands::Run {
            start_id,
            end_id,
            concurrency,
        } => run(config, id_range(start_id, end_id)?, concurrency),
        Commands::Progress { start_id, end_id } => progress(config, id_range(start_id, end_id)?),
        Commands::Clean { yes } => {
            clean::run(&config.scratch_dir(), yes).map_err(CliError::Clean)?;
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();

            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    init_logging(cli.verbose);

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let mut source = std::error::Error::source(&error);
            error!("{error}");

            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = std::error::Error::source(cause);
            }

            ExitCode::FAILURE
        }
    }
}
