use super::{
    job::{run_job, FAILED_SUFFIX},
    local::{fill_queue, LocalExecutor, QueueItem},
    Executor, JobStatus,
};
use crate::{
    binding::{partition, rankfile_name},
    checkpoint::load,
    config::{BatchConfig, BindingMode, FailurePolicy},
    solver::{Binding, Invocation, RunOutcome, SolverBackend, SolverError},
    unit::Layout,
};
use itertools::Itertools;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};
use tempfile::{tempdir, TempDir};

const INPUT: &str = "%pal nprocs 2 end\n! MP2 6-31G* TightSCF\n* xyz 0 1\nH 0 0 0\nH 0 0 0.74\n*\n";

/// Stand-in for ORCA: writes an output log and a binary file, converter writes the mkl file
#[derive(Debug, Default)]
struct FakeSolver {
    output: String,
    timed_out: bool,
    calls: AtomicUsize,
    conversions: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl FakeSolver {
    fn with_output(output: &str) -> Self {
        Self {
            output: output.to_owned(),
            ..Self::default()
        }
    }
}

impl SolverBackend for FakeSolver {
    fn solve(&self, invocation: &Invocation) -> Result<RunOutcome, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .push(fs::read_to_string(invocation.input)?);

        if let Binding::Rankfile(rankfile) = invocation.binding {
            assert!(rankfile.is_file(), "rankfile must exist while the solver runs");
        }

        fs::write(invocation.output, &self.output)?;
        fs::write(invocation.input.with_extension("gbw"), [0u8, 1, 2, 3])?;

        Ok(RunOutcome {
            elapsed: Duration::from_millis(5),
            status: if self.timed_out { None } else { Some(0) },
            timed_out: self.timed_out,
        })
    }

    fn convert(&self, workdir: &Path, basename: &str) -> Result<(), SolverError> {
        self.conversions.fetch_add(1, Ordering::SeqCst);
        fs::write(workdir.join(format!("{basename}.mkl")), "[Atoms]\n")?;

        Ok(())
    }
}

fn config(dir: &TempDir) -> BatchConfig {
    let mut config = BatchConfig::default();
    config.source_root = dir.path().join("source");
    config.work_root = dir.path().join("work");
    config.binding.pin_workers = false;
    fs::create_dir_all(&config.source_root).unwrap();

    config
}

fn write_input(config: &BatchConfig, id: u64, method: &str) {
    let layout = Layout::from_config(config);
    let unit = layout.unit(id, method);

    fs::create_dir_all(layout.molecule_dir(id)).unwrap();
    fs::write(layout.input_path(&unit), INPUT).unwrap();
}

fn names_in(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .sorted()
        .collect()
}

#[test]
pub fn queue_delivers_every_unit_exactly_once() {
    let layout = Layout::new(
        "/unused",
        "dsgdb9nsd",
        6,
        "631gs",
        ["mp2", "ccsd", "ccsdt"].map(String::from).to_vec(),
    );
    let (queue, queued) = fill_queue(layout.units(10..=12), 2).unwrap();

    assert_eq!(queued, 9);
    assert_eq!(queue.len(), 11);

    let received = thread::scope(|scope| {
        let handles = (0..2)
            .map(|_| {
                let queue = queue.clone();

                scope.spawn(move || {
                    let mut units = Vec::new();

                    while let Ok(QueueItem::Unit(unit)) = queue.recv() {
                        units.push(unit);
                    }

                    units
                })
            })
            .collect_vec();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect_vec()
    });

    assert_eq!(received.len(), 9);
    assert_eq!(received.iter().collect::<HashSet<_>>().len(), 9);
    assert!(queue.is_empty());
}

#[test]
pub fn queue_keeps_the_enumeration_order() {
    let layout = Layout::new("/unused", "m", 2, "b", vec!["a".to_owned(), "b".to_owned()]);
    let (queue, _) = fill_queue(layout.units(1..=2), 1).unwrap();

    let items = queue.try_iter().collect_vec();

    assert_eq!(
        items,
        vec![
            QueueItem::Unit(layout.unit(1, "a")),
            QueueItem::Unit(layout.unit(1, "b")),
            QueueItem::Unit(layout.unit(2, "a")),
            QueueItem::Unit(layout.unit(2, "b")),
            QueueItem::Stop,
        ]
    );
}

#[test]
pub fn single_unit_end_to_end() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    write_input(&config, 1, "mp2");

    let mut executor =
        LocalExecutor::load(config.clone(), FakeSolver::with_output("FINAL SINGLE POINT ENERGY -1.1\n"), 1)
            .unwrap();
    let report = executor.execute(1..=1, 1).unwrap();

    // only mp2 has an input, the other two methods are skipped
    assert_eq!(report.queued, 3);
    assert_eq!(report.completed, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 0);

    let job = "dsgdb9nsd_000001_mp2_631gs";
    let molecule_dir = config.source_root.join("dsgdb9nsd_000001");

    assert_eq!(
        fs::read_to_string(config.output_dir().join(format!("{job}.out"))).unwrap(),
        "FINAL SINGLE POINT ENERGY -1.1\n"
    );
    assert!(config.aux_dir().join(format!("{job}.mkl")).is_file());
    assert_eq!(
        names_in(&molecule_dir),
        [
            format!("{job}.gbw"),
            format!("{job}.inp"),
            format!("{job}.mkl"),
            format!("{job}.out"),
        ]
    );
    // staged input was patched, the permanent copy is the patched one
    assert!(fs::read_to_string(molecule_dir.join(format!("{job}.inp")))
        .unwrap()
        .starts_with("%pal nprocs 1 end\n! MP2"));
    assert!(names_in(&config.scratch_dir()).is_empty());
    assert!(!config.scratch_dir().join(rankfile_name(0)).exists());

    let checkpoint = load(&config.checkpoint_path()).unwrap();
    assert_eq!(
        serde_json::to_value(&checkpoint).unwrap(),
        serde_json::json!({"1": {"mp2": true}})
    );

    let solver = &executor.context().backend;
    assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(solver.conversions.load(Ordering::SeqCst), 1);
}

#[test]
pub fn rerun_skips_finished_units() {
    let dir = tempdir().unwrap();
    let mut config = config(&dir);
    config.methods = vec!["mp2".to_owned()];
    write_input(&config, 1, "mp2");
    write_input(&config, 2, "mp2");

    let mut executor = LocalExecutor::load(config.clone(), FakeSolver::with_output("ok\n"), 2).unwrap();
    assert_eq!(executor.execute(1..=2, 2).unwrap().completed, 2);

    let mut executor = LocalExecutor::load(config, FakeSolver::with_output("ok\n"), 2).unwrap();
    let report = executor.execute(1..=2, 2).unwrap();

    assert_eq!(report.queued, 0);
    assert_eq!(executor.context().backend.calls.load(Ordering::SeqCst), 0);
}

#[test]
pub fn many_units_over_several_slots() {
    let dir = tempdir().unwrap();
    let mut config = config(&dir);
    config.binding.cores_per_socket = 4;
    for id in 20..=27 {
        for method in ["mp2", "ccsd", "ccsdt"] {
            write_input(&config, id, method);
        }
    }

    let mut executor = LocalExecutor::load(config.clone(), FakeSolver::with_output("ok\n"), 8).unwrap();
    let report = executor.execute(20..=27, 3).unwrap();

    assert_eq!(report.completed, 24);
    assert_eq!(names_in(&config.output_dir()).len(), 24);

    let checkpoint = load(&config.checkpoint_path()).unwrap();
    assert_eq!(checkpoint.len(), 8);
    assert!(checkpoint.values().all(|methods| methods.len() == 3));

    // 8 cores over 3 slots leaves 2 processes per slot
    let inputs = executor.context().backend.inputs.lock();
    assert!(inputs.iter().all(|input| input.starts_with("%pal nprocs 2 end\n")));
    assert!(names_in(&config.scratch_dir()).is_empty());
}

#[test]
pub fn missing_input_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let executor = LocalExecutor::load(config.clone(), FakeSolver::default(), 4).unwrap();
    let context = executor.context();
    let slot = partition(4, 1).unwrap().slots()[0];

    let status = run_job(context, &context.layout.unit(7, "ccsd"), &slot).unwrap();

    assert_eq!(status, JobStatus::Skipped);
    assert!(context.checkpoint.snapshot().is_empty());
    assert!(!config.checkpoint_path().exists());
    assert!(names_in(&config.scratch_dir()).is_empty());
    assert_eq!(context.backend.calls.load(Ordering::SeqCst), 0);
}

#[test]
pub fn detected_errors_still_complete_by_default() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    write_input(&config, 3, "ccsd");
    let executor = LocalExecutor::load(
        config.clone(),
        FakeSolver::with_output("MDCI iteration 1\n[node:1234] *** Segmentation fault\n"),
        2,
    )
    .unwrap();
    let context = executor.context();
    let unit = context.layout.unit(3, "ccsd");
    let slot = partition(2, 1).unwrap().slots()[0];

    let status = run_job(context, &unit, &slot).unwrap();

    assert_eq!(status, JobStatus::Completed { flagged: true });
    let err = fs::read_to_string(context.layout.molecule_dir(3).join(unit.file_name("err"))).unwrap();
    assert!(err.contains("Matched Error: Segmentation fault"));
    assert!(err.contains("[node:1234] *** Segmentation fault"));
    assert!(context.checkpoint.is_completed(&context.layout, &unit));
}

#[test]
pub fn leave_pending_policy_keeps_broken_units_queued() {
    let dir = tempdir().unwrap();
    let mut config = config(&dir);
    config.failure_policy = FailurePolicy::LeavePending;
    write_input(&config, 4, "ccsdt");
    let executor =
        LocalExecutor::load(config.clone(), FakeSolver::with_output("aborting the run\n"), 2).unwrap();
    let context = executor.context();
    let unit = context.layout.unit(4, "ccsdt");
    let slot = partition(2, 2).unwrap().slots()[1];

    let status = run_job(context, &unit, &slot).unwrap();

    assert_eq!(status, JobStatus::Pending);
    assert!(!context.checkpoint.is_completed(&context.layout, &unit));
    assert!(!context.layout.output_path(&unit).exists());
    assert!(context
        .layout
        .molecule_dir(4)
        .join(format!("{}.{FAILED_SUFFIX}", unit.output_name()))
        .is_file());
    assert!(names_in(&config.output_dir()).is_empty());
}

#[test]
pub fn timeouts_are_flagged() {
    let dir = tempdir().unwrap();
    let mut config = config(&dir);
    config.binding.mode = BindingMode::Taskset;
    write_input(&config, 5, "mp2");
    let solver = FakeSolver {
        output: "SCF ITERATION 1\n".to_owned(),
        timed_out: true,
        ..FakeSolver::default()
    };
    let executor = LocalExecutor::load(config, solver, 2).unwrap();
    let context = executor.context();
    let slot = partition(2, 1).unwrap().slots()[0];

    let status = run_job(context, &context.layout.unit(5, "mp2"), &slot).unwrap();

    assert_eq!(status, JobStatus::Completed { flagged: true });
}

#[test]
pub fn too_many_slots_fail_before_any_work() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    write_input(&config, 1, "mp2");

    let mut executor = LocalExecutor::load(config, FakeSolver::default(), 2).unwrap();

    assert!(executor.execute(1..=1, 3).is_err());
    assert_eq!(executor.context().backend.calls.load(Ordering::SeqCst), 0);
}

#[test]
pub fn corrupt_checkpoint_stops_the_batch() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    fs::create_dir_all(&config.work_root).unwrap();
    fs::write(config.checkpoint_path(), "{{{").unwrap();

    assert!(LocalExecutor::load(config, FakeSolver::default(), 2).is_err());
}
