pub mod job;
pub mod local;

#[cfg(test)]
mod local_test;

use crate::{
    checkpoint::CheckpointError, config::ConfigErrors, solver::SolverError, staging::StagingError,
};
use std::{fmt, ops::RangeInclusive};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid batch configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to prepare working directories")]
    Setup(#[from] std::io::Error),
    #[error("Failed to spawn worker for slot {0}")]
    SpawnWorker(usize, #[source] std::io::Error),
    #[error("Work queue closed while filling it")]
    QueueClosed,
}

/// Errors that end one work unit early, they never leave the worker
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to stage input")]
    Staging(#[from] StagingError),
    #[error("Failed to write rankfile")]
    Rankfile(#[source] std::io::Error),
    #[error("Failed to run solver")]
    Solver(#[from] SolverError),
    #[error("Failed to record completion")]
    Checkpoint(#[from] CheckpointError),
}

/// Final state of one work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// input missing, nothing was touched
    Skipped,
    /// ran and was recorded in the checkpoint, `flagged` if the output looked broken
    Completed { flagged: bool },
    /// ran, looked broken, and the failure policy kept it out of the checkpoint
    Pending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub queued: usize,
    pub completed: usize,
    pub flagged: usize,
    pub skipped: usize,
    pub pending: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn record(&mut self, result: &Result<JobStatus, JobError>) {
        match result {
            Ok(JobStatus::Skipped) => self.skipped += 1,
            Ok(JobStatus::Completed { flagged }) => {
                self.completed += 1;
                if *flagged {
                    self.flagged += 1;
                }
            }
            Ok(JobStatus::Pending) => self.pending += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &BatchReport) {
        self.completed += other.completed;
        self.flagged += other.flagged;
        self.skipped += other.skipped;
        self.pending += other.pending;
        self.failed += other.failed;
    }

    pub fn processed(&self) -> usize {
        self.completed + self.skipped + self.pending + self.failed
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} queued, {} completed ({} flagged), {} skipped, {} pending, {} failed",
            self.queued, self.completed, self.flagged, self.skipped, self.pending, self.failed
        )
    }
}

pub trait Executor {
    /// Run every pending unit of `ids` with `concurrency` workers and block until all are done
    fn execute(
        &mut self,
        ids: RangeInclusive<u64>,
        concurrency: usize,
    ) -> Result<BatchReport, ExecutorError>;
}
