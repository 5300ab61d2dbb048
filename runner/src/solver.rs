pub mod orca;


use crate::binding::CoreRange;
use std::{
    path::Path,
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Failed to create solver output {path:?}")]
    Output {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Failed to wait for a child process")]
    ChildError(#[from] std::io::Error),
    #[error("Converter exited with {0}")]
    ConverterFailed(ExitStatus),
    #[error("Converter timeout")]
    ConverterTimeout,
}

/// How the solver is pinned to its slot for one invocation
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    Rankfile(&'a Path),
    Taskset(CoreRange),
    None,
}

/// Everything needed to launch the solver on one staged input
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub input: &'a Path,
    /// receives stdout and stderr combined
    pub output: &'a Path,
    pub workdir: &'a Path,
    pub binding: Binding<'a>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// container for information extracted from running the solver
pub struct RunOutcome {
    pub elapsed: Duration,
    /// exit code, `None` if killed by a signal or by the timeout
    pub status: Option<i32>,
    pub timed_out: bool,
}

/// External programs a job runs. The exit status of `solve` is informational only, success is
/// judged from the artifacts it leaves behind.
pub trait SolverBackend: Send + Sync {
    fn solve(&self, invocation: &Invocation) -> Result<RunOutcome, SolverError>;

    /// Convert `<workdir>/<basename>.gbw` into the auxiliary format
    fn convert(&self, workdir: &Path, basename: &str) -> Result<(), SolverError>;
}
