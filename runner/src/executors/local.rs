use super::{
    job::{run_job, JobContext},
    BatchReport, Executor, ExecutorError,
};
use crate::{
    binding::{self, Slot},
    checkpoint::CheckpointStore,
    config::{BatchConfig, BindingMode, ConfigErrors},
    progress,
    solver::SolverBackend,
    unit::{Layout, WorkUnit},
};
use crossbeam_channel::{unbounded, Receiver};
use itertools::Itertools;
use std::{ops::RangeInclusive, path::Path, process::Command, thread};
use tracing::{debug, error, info, instrument, warn};

/// Entries of the shared work queue, one `Stop` ends exactly one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Unit(WorkUnit),
    Stop,
}

/// Fill a queue with `units` in order followed by one stop marker per worker.
/// Returns the receiving side and the number of queued units.
pub fn fill_queue<I>(units: I, workers: usize) -> Result<(Receiver<QueueItem>, usize), ExecutorError>
where
    I: IntoIterator<Item = WorkUnit>,
{
    let (sender, receiver) = unbounded();
    let mut queued = 0;

    for item in units
        .into_iter()
        .map(QueueItem::Unit)
        .chain(std::iter::repeat(QueueItem::Stop).take(workers))
    {
        if let QueueItem::Unit(_) = item {
            queued += 1;
        }

        // the receiver is alive until we return, sending cannot fail
        if sender.send(item).is_err() {
            return Err(ExecutorError::QueueClosed);
        }
    }

    Ok((receiver, queued))
}

/// Executor running one long-lived worker thread per core slot on the local node
#[derive(Debug)]
pub struct LocalExecutor<B> {
    context: JobContext<B>,
    total_cores: usize,
}

impl<B: SolverBackend> LocalExecutor<B> {
    /// create a new LocalExecutor, preparing directories and loading the checkpoint
    pub fn load(mut config: BatchConfig, backend: B, total_cores: usize) -> Result<Self, ExecutorError> {
        config.absolutize()?;
        config.ensure_dirs()?;

        let checkpoint =
            CheckpointStore::open(config.checkpoint_path()).map_err(ConfigErrors::from)?;
        let layout = Layout::from_config(&config);

        Ok(Self {
            context: JobContext {
                config,
                layout,
                checkpoint,
                backend,
            },
            total_cores,
        })
    }

    pub fn context(&self) -> &JobContext<B> {
        &self.context
    }
}

fn pin_to(slot: &Slot) {
    match affinity::set_thread_affinity(slot.range.cores()) {
        Ok(()) => debug!("Pinned slot {} to cores {}", slot.index, slot.range),
        Err(error) => warn!(
            "Failed to pin slot {} to cores {}, running unpinned: {error}",
            slot.index, slot.range
        ),
    }
}

/// Worker loop: take units until a stop marker arrives, one unit at a time
fn work<B: SolverBackend>(
    context: &JobContext<B>,
    slot: Slot,
    queue: Receiver<QueueItem>,
    pin: bool,
) -> BatchReport {
    if pin {
        pin_to(&slot);
    }

    let mut report = BatchReport::default();

    while let Ok(QueueItem::Unit(unit)) = queue.recv() {
        let result = run_job(context, &unit, &slot);

        if let Err(ref error) = result {
            error!(slot = slot.index, job = %unit, error = ?error, "EXEC ERROR: {error}");
        }

        report.record(&result);
    }

    debug!("Slot {} stopped after {} units", slot.index, report.processed());

    report
}

/// Run the end-of-batch summary script, it never fails the batch
pub fn run_summary_script(script: &Path, workdir: &Path) {
    info!(script = ?script, "Running summary script");

    match Command::new(script).current_dir(workdir).status() {
        Ok(status) if status.success() => debug!("Summary script finished"),
        Ok(status) => warn!("Summary script exited with {status}"),
        Err(error) => warn!(error = ?error, "Failed to launch summary script"),
    }
}

impl<B: SolverBackend> Executor for LocalExecutor<B> {
    /// execute all pending units of `ids` on `concurrency` pinned workers
    #[instrument(skip(self), level = "info")]
    fn execute(
        &mut self,
        ids: RangeInclusive<u64>,
        concurrency: usize,
    ) -> Result<BatchReport, ExecutorError> {
        let partition = binding::partition(self.total_cores, concurrency)?;
        let context = &self.context;

        info!(
            "CONFIG: {} cores -> {concurrency} slots * {} cores",
            self.total_cores, partition.cores_per_slot
        );
        info!("Binding: [{}]", partition.ranges.iter().join(", "));

        if context.config.binding.mode == BindingMode::Rankfile {
            let cores_per_socket = context.config.binding.cores_per_socket;

            for slot in partition.crossing_slots(cores_per_socket) {
                warn!(
                    "Slot {} ({} cores, {}) crosses a socket boundary of {cores_per_socket} cores, \
                     its rankfile addresses cores beyond the first socket",
                    slot.index,
                    slot.range.len(),
                    slot.range
                );
            }
        }

        progress::report(&context.layout, &ids, &context.checkpoint.snapshot());

        let pending = context
            .layout
            .units(ids.clone())
            .filter(|unit| !context.checkpoint.is_completed(&context.layout, unit));
        let (queue, queued) = fill_queue(pending, concurrency)?;
        let mut report = BatchReport {
            queued,
            ..BatchReport::default()
        };

        if queued == 0 {
            info!("All tasks completed in range, skipping.");

            return Ok(report);
        }

        info!("Queued {queued} pending tasks.");

        let pin = context.config.binding.pin_workers;

        thread::scope(|scope| -> Result<(), ExecutorError> {
            let handles = partition
                .slots()
                .into_iter()
                .map(|slot| {
                    let queue = queue.clone();

                    thread::Builder::new()
                        .name(format!("slot-{}", slot.index))
                        .spawn_scoped(scope, move || work(context, slot, queue, pin))
                        .map_err(|error| ExecutorError::SpawnWorker(slot.index, error))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for handle in handles {
                match handle.join() {
                    Ok(worker_report) => report.merge(&worker_report),
                    Err(_) => error!("A worker panicked, its remaining units stay pending"),
                }
            }

            Ok(())
        })?;

        progress::report(&context.layout, &ids, &context.checkpoint.snapshot());

        if let Some(ref script) = context.config.summary_script {
            run_summary_script(script, &context.config.source_root);
        }

        info!("=== CHUNK DONE: {report} ===");

        Ok(report)
    }
}
