use crate::{checkpoint::CheckpointError, diagnostics::DEFAULT_ERROR_PATTERNS};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

/// config file picked up from the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "qmbatch.yaml";

pub fn open(path: &Path) -> Result<File, ConfigErrors> {
    File::open(path).map_err(|source| ConfigErrors::Open {
        path: path.to_path_buf(),
        source,
    })
}

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to open config file {path:?}")]
    Open { path: PathBuf, source: Error },
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Preflight checks failed, see the log above")]
    Preflight,
    #[error("Invalid id range {start}..={end}, start must not exceed end")]
    InvalidRange { start: u64, end: u64 },
    #[error("Cannot split {cores} cores into {slots} slots")]
    InvalidPartition { cores: usize, slots: usize },
    #[error("Checkpoint could not be loaded")]
    Checkpoint(#[from] CheckpointError),
}

/// How a single solver invocation is pinned to its slot's cores
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    /// OpenMPI rankfile, one line per rank with socket-aware core ids
    #[default]
    Rankfile,
    /// wrap the solver in `taskset -c <range>`
    Taskset,
    None,
}

/// What happens to the checkpoint when a unit ran but looks broken
/// (matched an error pattern or hit the timeout)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// record the unit as done anyway, triage happens through `.err` files
    #[default]
    MarkComplete,
    /// keep the unit pending so the next run picks it up again
    LeavePending,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct BatchConfig {
    // root holding one directory per molecule, the permanent home of every job artifact
    pub source_root: PathBuf,
    // root of the node-local working area, the directories below default relative to it
    pub work_root: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub aux_dir: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,

    pub dataset_prefix: String,
    pub id_width: usize,
    pub methods: Vec<String>,
    pub basis: String,

    pub solver: SolverConfig,
    pub converter: ConverterConfig,
    pub binding: BindingConfig,
    pub failure_policy: FailurePolicy,
    pub error_patterns: Vec<String>,
    pub summary_script: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct SolverConfig {
    // install prefix, `bin/` is prepended to PATH for the solver and converter
    pub home: PathBuf,
    // defaults to `<home>/bin/orca`
    pub exec: Option<PathBuf>,
    // defaults to `<home>/lib`
    pub library_path: Option<PathBuf>,
    // wall-clock limit per invocation in seconds
    pub timeout: u64,
    // MPI mapping flags passed before `-rf <rankfile>` in rankfile mode
    pub args: Vec<String>,
    pub report_bindings: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ConverterConfig {
    pub exec: PathBuf,
    pub args: Vec<String>,
    // extension of the converted file, also used for the aggregation copy
    pub extension: String,
    // seconds
    pub timeout: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct BindingConfig {
    pub mode: BindingMode,
    pub cores_per_socket: usize,
    // pin every worker thread to its core range so the solver inherits the mask
    pub pin_workers: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("source_files"),
            work_root: PathBuf::from("."),
            scratch_dir: None,
            output_dir: None,
            aux_dir: None,
            checkpoint: None,
            dataset_prefix: String::from("dsgdb9nsd"),
            id_width: 6,
            methods: ["mp2", "ccsd", "ccsdt"].map(String::from).to_vec(),
            basis: String::from("631gs"),
            solver: SolverConfig::default(),
            converter: ConverterConfig::default(),
            binding: BindingConfig::default(),
            failure_policy: FailurePolicy::default(),
            error_patterns: DEFAULT_ERROR_PATTERNS.map(String::from).to_vec(),
            summary_script: None,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/opt/orca"),
            exec: None,
            library_path: None,
            timeout: 4 * 60 * 60,
            args: ["--bind-to", "core", "--map-by", "core"]
                .map(String::from)
                .to_vec(),
            report_bindings: false,
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("orca_2mkl"),
            args: vec![String::from("-mkl")],
            extension: String::from("mkl"),
            timeout: 10 * 60,
        }
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            mode: BindingMode::default(),
            cores_per_socket: 16,
            pin_workers: true,
        }
    }
}

impl SolverConfig {
    pub fn exec(&self) -> PathBuf {
        self.exec
            .clone()
            .unwrap_or_else(|| self.home.join("bin").join("orca"))
    }

    pub fn library_path(&self) -> PathBuf {
        self.library_path
            .clone()
            .unwrap_or_else(|| self.home.join("lib"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl BatchConfig {
    /// Load the config from `path`, or from `qmbatch.yaml` if present, or fall back to defaults.
    /// An explicitly requested file that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        let path = match path {
            Some(path) if !path.is_file() => {
                return Err(ConfigErrors::FileNotFound(path.to_path_buf()))
            }
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);

                if !fallback.is_file() {
                    warn!("No {DEFAULT_CONFIG_FILE} found, running with built-in defaults");

                    return Ok(Self::default());
                }

                fallback
            }
        };

        info!(path = ?path, "Loading config");

        Self::from_reader(open(&path)?)
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self, ConfigErrors> {
        let mut config: Self = serde_yaml::from_reader(reader)?;
        config.normalize();

        Ok(config)
    }

    /// Trim method names, drop empty ones and repeats. Names are kept as written since they are
    /// part of every derived file name and checkpoint key.
    pub fn normalize(&mut self) {
        self.methods = self
            .methods
            .iter()
            .map(|method| method.trim().to_owned())
            .filter(|method| !method.is_empty())
            .unique()
            .collect_vec();
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join("orca_files"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join("orca_output").join("orca_out"))
    }

    pub fn aux_dir(&self) -> PathBuf {
        self.aux_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join("orca_output").join("orca_mkl"))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .clone()
            .unwrap_or_else(|| self.work_root.join("checkpoint.json"))
    }

    /// Anchor every relative path at the current directory. The solver runs inside the scratch
    /// directory, so paths handed to it must not depend on the working directory.
    pub fn absolutize(&mut self) -> Result<(), Error> {
        let cwd = env::current_dir()?;
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = cwd.join(&*path);
            }
        };

        anchor(&mut self.source_root);
        anchor(&mut self.work_root);

        for path in [
            &mut self.scratch_dir,
            &mut self.output_dir,
            &mut self.aux_dir,
            &mut self.checkpoint,
            &mut self.summary_script,
        ]
        .into_iter()
        .flatten()
        {
            anchor(path);
        }

        Ok(())
    }

    /// Create the scratch and aggregation directories, existing ones are left untouched
    pub fn ensure_dirs(&self) -> Result<(), Error> {
        for dir in [self.scratch_dir(), self.output_dir(), self.aux_dir()] {
            fs::create_dir_all(dir)?;
        }

        if let Some(parent) = self.checkpoint_path().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }

    /// Validate the config and normalize the method list.
    /// Returns true if any error was found, every problem is logged.
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.source_root.is_dir() {
            error!(
                "source_root {} is not a directory",
                self.source_root.to_string_lossy()
            );
            contains_error = true;
        }

        self.normalize();

        if self.methods.is_empty() {
            error!("No method was defined, unable to build a queue of work units");
            contains_error = true;
        }

        if self.basis.trim().is_empty() {
            error!("basis cannot be empty, it is part of every file name");
            contains_error = true;
        }

        if self.id_width == 0 {
            error!("id_width cannot be 0");
            contains_error = true;
        }

        let exec = self.solver.exec();

        match check_executable(&exec) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Solver target {} is not executable",
                    exec.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to find solver.exec ({}): {e}",
                    exec.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.solver.timeout == 0 {
            error!("solver.timeout cannot be 0, every job would be killed immediately");
            contains_error = true;
        }

        if self.binding.cores_per_socket == 0 {
            error!("binding.cores_per_socket cannot be 0");
            contains_error = true;
        }

        if self.converter.extension.is_empty() {
            warn!("converter.extension is empty, converted files will not be collected");
        }

        if self.error_patterns.is_empty() {
            warn!("No error patterns configured, failed jobs will not produce .err files");
        }

        if let Some(ref script) = self.summary_script {
            if !script.is_file() {
                warn!(
                    "summary_script {} not found, it will be skipped",
                    script.to_string_lossy()
                );
            }
        }

        contains_error
    }
}

/// Total number of cores the batch may use, SLURM's allocation wins over the detected count
pub fn detect_total_cores() -> usize {
    total_cores_from(env::var("SLURM_CPUS_ON_NODE").ok(), num_cpus::get())
}

pub fn total_cores_from(slurm: Option<String>, detected: usize) -> usize {
    match slurm.as_deref().map(str::trim).map(str::parse::<usize>) {
        Some(Ok(cores)) if cores > 0 => cores,
        Some(_) => {
            warn!("SLURM_CPUS_ON_NODE is not a positive integer, using {detected} detected cores");
            detected
        }
        None => detected,
    }
}

/// Concurrency used when none is requested, tuned for the node types the batches run on
pub fn default_concurrency(total_cores: usize) -> usize {
    let concurrency = if total_cores >= 96 {
        10
    } else if total_cores >= 64 {
        8
    } else {
        4
    };

    concurrency.min(total_cores).max(1)
}
