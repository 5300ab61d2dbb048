use super::{Binding, Invocation, RunOutcome, SolverBackend, SolverError};
use crate::config::BatchConfig;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    env,
    ffi::OsString,
    fs::File,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// ORCA driven through its MPI launcher, plus `orca_2mkl` style converters
#[derive(Debug, Clone)]
pub struct OrcaSolver {
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub report_bindings: bool,
    pub converter: PathBuf,
    pub converter_args: Vec<String>,
    pub converter_timeout: Duration,
    bin_dir: PathBuf,
    library_path: PathBuf,
}

/// `prefix` followed by the current value of the variable, if any
fn prefixed_env(name: &str, prefix: &Path) -> OsString {
    let mut paths = vec![prefix.to_path_buf()];

    if let Some(current) = env::var_os(name) {
        paths.extend(env::split_paths(&current));
    }

    env::join_paths(paths).unwrap_or_else(|error| {
        warn!(error = ?error, "Cannot extend {name}, using {} alone", prefix.to_string_lossy());
        prefix.as_os_str().to_owned()
    })
}

/// Kill the whole process group led by `child` and reap the leader. MPI ranks are grandchildren
/// of the launcher and would otherwise keep the slot's cores busy.
fn kill_and_reap(child: &mut Child) -> Result<(), SolverError> {
    let group = Pid::from_raw(child.id() as i32);

    if let Err(errno) = killpg(group, Signal::SIGKILL) {
        debug!(error = ?errno, "Killing process group {group} failed, killing the leader only");

        // the child may have exited between the timeout and the kill
        if let Err(error) = child.kill() {
            debug!(error = ?error, "Kill after timeout failed");
        }
    }
    child.wait()?;

    Ok(())
}

impl OrcaSolver {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            exec: config.solver.exec(),
            args: config.solver.args.clone(),
            report_bindings: config.solver.report_bindings,
            converter: config.converter.exec.clone(),
            converter_args: config.converter.args.clone(),
            converter_timeout: Duration::from_secs(config.converter.timeout),
            bin_dir: config.solver.home.join("bin"),
            library_path: config.solver.library_path(),
        }
    }

    fn apply_env(&self, command: &mut Command) {
        command
            .env("PATH", prefixed_env("PATH", &self.bin_dir))
            .env(
                "LD_LIBRARY_PATH",
                prefixed_env("LD_LIBRARY_PATH", &self.library_path),
            );
    }

    /// Build the solver command line for `invocation`, without any stdio wiring
    pub fn command(&self, invocation: &Invocation) -> Command {
        let mut command = match invocation.binding {
            Binding::Taskset(range) => {
                let mut command = Command::new("taskset");
                command
                    .arg("-c")
                    .arg(range.to_string())
                    .arg(&self.exec)
                    .arg(invocation.input);
                command
            }
            Binding::Rankfile(rankfile) => {
                let mut command = Command::new(&self.exec);
                command
                    .arg(invocation.input)
                    .args(&self.args)
                    .arg("-rf")
                    .arg(rankfile);
                if self.report_bindings {
                    command.arg("--report-bindings");
                }
                command
            }
            Binding::None => {
                let mut command = Command::new(&self.exec);
                command.arg(invocation.input);
                command
            }
        };

        // own process group, so a timeout can take down every rank at once
        command.current_dir(invocation.workdir).process_group(0);
        self.apply_env(&mut command);

        command
    }
}

impl SolverBackend for OrcaSolver {
    fn solve(&self, invocation: &Invocation) -> Result<RunOutcome, SolverError> {
        let output_error = |source| SolverError::Output {
            path: invocation.output.to_path_buf(),
            source,
        };
        let stdout = File::create(invocation.output).map_err(output_error)?;
        let stderr = stdout.try_clone().map_err(output_error)?;

        let mut command = self.command(invocation);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        debug!(command = ?command, "Spawning solver");

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| SolverError::Spawn {
            program: self.exec.to_string_lossy().into_owned(),
            source,
        })?;

        match child.wait_timeout(invocation.timeout)? {
            Some(status) => Ok(RunOutcome {
                elapsed: start.elapsed(),
                status: status.code(),
                timed_out: false,
            }),
            None => {
                // child hasn't exited yet
                warn!(
                    "Solver exceeded {}s, killing pid {}",
                    invocation.timeout.as_secs(),
                    child.id()
                );
                kill_and_reap(&mut child)?;

                Ok(RunOutcome {
                    elapsed: start.elapsed(),
                    status: None,
                    timed_out: true,
                })
            }
        }
    }

    fn convert(&self, workdir: &Path, basename: &str) -> Result<(), SolverError> {
        let mut command = Command::new(&self.converter);
        command
            .arg(basename)
            .args(&self.converter_args)
            .current_dir(workdir)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        self.apply_env(&mut command);

        let mut child = command.spawn().map_err(|source| SolverError::Spawn {
            program: self.converter.to_string_lossy().into_owned(),
            source,
        })?;

        match child.wait_timeout(self.converter_timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(SolverError::ConverterFailed(status)),
            None => {
                kill_and_reap(&mut child)?;

                Err(SolverError::ConverterTimeout)
            }
        }
    }
}
