use super::{JobError, JobStatus};
use crate::{
    binding::{RankFile, Slot},
    checkpoint::CheckpointStore,
    config::{BatchConfig, BindingMode, FailurePolicy},
    diagnostics,
    solver::{Binding, Invocation, SolverBackend},
    staging::{self, ArtifactMatcher},
    unit::{Layout, WorkUnit},
};
use std::{fs, path::Path};
use tracing::{debug, info, instrument, warn};

/// extension of the solver's binary wavefunction file, the converter's input
pub const BINARY_EXTENSION: &str = "gbw";

/// suffix appended to the output of a unit that stays pending, so the canonical `.out`
/// never shows up in the molecule directory for a run that is meant to be repeated
pub const FAILED_SUFFIX: &str = "failed";

/// Everything a worker needs to run units, shared by reference between all workers
#[derive(Debug)]
pub struct JobContext<B> {
    pub config: BatchConfig,
    pub layout: Layout,
    pub checkpoint: CheckpointStore,
    pub backend: B,
}

/// Run one work unit on `slot`: stage, patch, solve, post-process and record it
#[instrument(skip_all, fields(slot = slot.index, job = %unit), level = "info")]
pub fn run_job<B: SolverBackend>(
    context: &JobContext<B>,
    unit: &WorkUnit,
    slot: &Slot,
) -> Result<JobStatus, JobError> {
    let config = &context.config;
    let source = context.layout.input_path(unit);

    if !source.is_file() {
        info!(path = ?source, "SKIP: input missing");

        return Ok(JobStatus::Skipped);
    }

    let scratch = config.scratch_dir();
    let staged = staging::stage_input(&source, &scratch)?;
    staging::patch_file(&staged, slot.nprocs)?;

    let output = scratch.join(unit.output_name());
    let rankfile = match config.binding.mode {
        BindingMode::Rankfile => Some(
            RankFile::create(&scratch, slot, config.binding.cores_per_socket)
                .map_err(JobError::Rankfile)?,
        ),
        BindingMode::Taskset | BindingMode::None => None,
    };
    let binding = match (config.binding.mode, &rankfile) {
        (_, Some(rankfile)) => Binding::Rankfile(rankfile),
        (BindingMode::Taskset, None) => Binding::Taskset(slot.range),
        _ => Binding::None,
    };

    info!(nprocs = slot.nprocs, "START on cores {}", slot.range);

    let result = context.backend.solve(&Invocation {
        input: &staged,
        output: &output,
        workdir: &scratch,
        binding,
        timeout: config.solver.timeout(),
    });
    // the rankfile only lives as long as the solver
    drop(rankfile);
    let outcome = result?;

    info!(
        status = ?outcome.status,
        timed_out = outcome.timed_out,
        "FINISHED in {:.1}s",
        outcome.elapsed.as_secs_f64()
    );

    convert_binary(context, unit, &scratch);

    let detected = detect_errors(context, unit, &scratch, &output);
    let flagged = detected || outcome.timed_out;
    let keep_pending = flagged && config.failure_policy == FailurePolicy::LeavePending;

    if keep_pending {
        set_aside_output(&output);
    } else {
        collect_aggregates(config, unit, &scratch, &output);
    }

    relocate(unit, &scratch, &context.layout.molecule_dir(unit.molecule_id()));

    if keep_pending {
        warn!("PENDING: output looks broken, leaving the unit out of the checkpoint");

        return Ok(JobStatus::Pending);
    }

    context.checkpoint.mark_completed(unit)?;
    info!("DONE (checkpoint updated)");

    Ok(JobStatus::Completed { flagged })
}

/// Run the converter if the solver left a binary file, failures are only logged
fn convert_binary<B: SolverBackend>(context: &JobContext<B>, unit: &WorkUnit, scratch: &Path) {
    if !scratch.join(unit.file_name(BINARY_EXTENSION)).is_file() {
        debug!("No {BINARY_EXTENSION} file, nothing to convert");

        return;
    }

    match context.backend.convert(scratch, unit.basename()) {
        Ok(()) => debug!("Converted {BINARY_EXTENSION} file"),
        Err(error) => warn!(error = ?error, "CONVERSION ERROR: {error}"),
    }
}

/// Scan the output for known failure messages and write the `.err` report next to it
fn detect_errors<B>(context: &JobContext<B>, unit: &WorkUnit, scratch: &Path, output: &Path) -> bool {
    let found = match diagnostics::scan_file(output, &context.config.error_patterns) {
        Ok(found) => found,
        Err(error) => {
            warn!(error = ?error, "Failed to read solver output for error scan");

            return false;
        }
    };

    match found {
        Some(found) => {
            warn!(pattern = %found.pattern, "ERROR DETECTED, creating .err file");

            if let Err(error) =
                diagnostics::write_report(&scratch.join(unit.file_name("err")), unit.basename(), &found)
            {
                warn!(error = ?error, "Failed to write .err file");
            }

            true
        }
        None => false,
    }
}

fn set_aside_output(output: &Path) {
    let mut failed = output.as_os_str().to_owned();
    failed.push(".");
    failed.push(FAILED_SUFFIX);

    if let Err(error) = fs::rename(output, &failed) {
        warn!(error = ?error, "Failed to set aside broken output");
    }
}

/// Copy the output and the converted file into the aggregation directories
fn collect_aggregates(config: &BatchConfig, unit: &WorkUnit, scratch: &Path, output: &Path) {
    if output.is_file() {
        if let Err(error) = staging::copy_into(output, &config.output_dir()) {
            warn!(error = ?error, "Failed to copy output to aggregation directory");
        }
    }

    let extension = &config.converter.extension;
    let converted = scratch.join(unit.file_name(extension));

    if !extension.is_empty() && converted.is_file() {
        if let Err(error) = staging::copy_into(&converted, &config.aux_dir()) {
            warn!(error = ?error, "Failed to copy {extension} file to aggregation directory");
        }
    }
}

/// Move every staged artifact of the unit into its molecule directory
fn relocate(unit: &WorkUnit, scratch: &Path, molecule_dir: &Path) {
    let files = match ArtifactMatcher::new(unit.basename()).and_then(|matcher| matcher.collect(scratch)) {
        Ok(files) => files,
        Err(error) => {
            warn!(error = ?error, "Failed to list staged artifacts");

            return;
        }
    };

    let mut moved = 0;

    for file in files {
        match staging::move_into(&file, molecule_dir) {
            Ok(_) => moved += 1,
            Err(error) => warn!(error = ?error, "Failed to move artifact back"),
        }
    }

    debug!("Moved {moved} artifacts to {}", molecule_dir.to_string_lossy());
}
