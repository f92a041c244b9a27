//! Calculations submitted to a batch queue and polled until the job finishes.
//!
//! The scheduler and the clock are passed in explicitly, so polling can be
//! driven by a fake clock in tests and no process-wide scheduler state exists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::calculation::{read_observation, remove_stale, Calculation, InputDeck};
use crate::error::{ConvergenceError, Result};
use crate::observation::{CalculationFailure, Observation, RunOutcome, RunStatus};
use crate::options::QueueOptions;

/// State of a submitted job as reported by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    /// True once the scheduler will not change the state again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    fn run_status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Success,
            Self::TimedOut => RunStatus::TimedOut,
            Self::Cancelled => RunStatus::Cancelled,
            Self::Failed | Self::Pending | Self::Running => RunStatus::Failed(1),
        }
    }
}

/// Batch scheduler used by [`QueuedCalculation`].
pub trait JobScheduler {
    /// Submits `script` from `directory`, returning the job identifier.
    fn submit(&mut self, directory: &Path, script: &str) -> io::Result<String>;

    /// Current state of a previously submitted job.
    fn state(&mut self, job: &str) -> io::Result<JobState>;

    /// Asks the scheduler to stop a job that is no longer awaited.
    fn cancel(&mut self, _job: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Source of elapsed time and blocking waits.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn elapsed(&self) -> Duration;

    fn sleep(&mut self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`thread::sleep`].
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// SLURM scheduler driven through `sbatch`, `scontrol`, and `scancel`.
#[derive(Clone, Debug, Default)]
pub struct SlurmScheduler;

impl JobScheduler for SlurmScheduler {
    fn submit(&mut self, directory: &Path, script: &str) -> io::Result<String> {
        let output = Command::new("sbatch")
            .arg(script)
            .current_dir(directory)
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "could not queue the calculation: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        parse_submission(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "sbatch did not report a job id")
        })
    }

    fn state(&mut self, job: &str) -> io::Result<JobState> {
        let output = Command::new("scontrol")
            .args(["show", "job", job])
            .output()?;
        let report = String::from_utf8_lossy(&output.stdout);
        find_job_state(&report).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("no JobState for job {job}"))
        })
    }

    fn cancel(&mut self, job: &str) -> io::Result<()> {
        Command::new("scancel").arg(job).status().map(|_| ())
    }
}

/// Extracts the job id from `Submitted batch job <id>`.
pub fn parse_submission(stdout: &str) -> Option<String> {
    let mut words = stdout.split_whitespace();
    while let Some(word) = words.next() {
        if word == "job" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// Reads the `JobState=` field of `scontrol show job` output.
pub fn find_job_state(report: &str) -> Option<JobState> {
    let value = report
        .split_whitespace()
        .find_map(|field| field.strip_prefix("JobState="))?;
    Some(match value {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "TIMEOUT" | "DEADLINE" => JobState::TimedOut,
        "CANCELLED" | "PREEMPTED" => JobState::Cancelled,
        _ => JobState::Failed,
    })
}

/// Reads a file written by the job, naming it by `pattern` with `{job}` substituted.
/// Absent or unreadable files capture as empty.
fn capture(directory: &Path, pattern: Option<&str>, job: &str) -> String {
    pattern
        .map(|pattern| directory.join(pattern.replace("{job}", job)))
        .and_then(|path| fs::read_to_string(path).ok())
        .unwrap_or_default()
}

/// Calculation whose run is a queued batch job.
///
/// `write_inputs` writes the parameter deck and the submission script;
/// `run` submits the script, polls every `poll_interval` until the job reaches a
/// terminal state or `max_wait` passes, and `parse_output` reads the JSON
/// output file.
pub struct QueuedCalculation<S, C = SystemClock> {
    name: String,
    deck: InputDeck,
    script: String,
    scheduler: S,
    clock: C,
    options: QueueOptions,
    last_job: Option<String>,
}

impl<S: JobScheduler> QueuedCalculation<S, SystemClock> {
    pub fn new(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        script: impl Into<String>,
        scheduler: S,
        options: QueueOptions,
    ) -> Result<Self> {
        Self::with_clock(name, directory, script, scheduler, SystemClock::default(), options)
    }
}

impl<S: JobScheduler, C: Clock> QueuedCalculation<S, C> {
    pub fn with_clock(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        script: impl Into<String>,
        scheduler: S,
        clock: C,
        options: QueueOptions,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            deck: InputDeck::new(directory, "input.txt")?,
            script: script.into(),
            scheduler,
            clock,
            options,
            last_job: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        self.deck.directory()
    }

    /// Identifier of the most recently submitted job.
    pub fn last_job(&self) -> Option<&str> {
        self.last_job.as_deref()
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn set_parameter(
        &mut self,
        key: impl Into<String>,
        value: impl std::fmt::Display,
    ) -> Result<()> {
        self.deck.set(key, value)
    }

    fn output_path(&self) -> PathBuf {
        self.deck.directory().join(&self.options.output_file)
    }

    fn failed(&self, started: Duration, reason: String) -> RunOutcome {
        warn!("{}: {reason}", self.name);
        RunOutcome::failed(-1)
            .with_output("", reason)
            .with_duration(self.clock.elapsed().saturating_sub(started))
    }

    /// Polls until the job is terminal, or returns `None` once `max_wait` has passed.
    fn wait_for(&mut self, job: &str, started: Duration) -> io::Result<Option<JobState>> {
        loop {
            let state = self.scheduler.state(job)?;
            if state.is_terminal() {
                return Ok(Some(state));
            }
            let waited = self.clock.elapsed().saturating_sub(started);
            if self.options.max_wait.is_some_and(|max_wait| waited >= max_wait) {
                return Ok(None);
            }
            debug!("{}: job {job} is {state:?} after {waited:?}", self.name);
            self.clock.sleep(self.options.poll_interval);
        }
    }
}

impl<S: JobScheduler, C: Clock> Calculation for QueuedCalculation<S, C> {
    fn write_inputs(&mut self) -> Result<()> {
        self.deck.write()?;
        let script = self.deck.directory().join(&self.options.script_name);
        fs::write(&script, &self.script)
            .map_err(|err| ConvergenceError::io(format!("writing {}", script.display()), err))?;
        debug!("{}: wrote {}", self.name, script.display());
        Ok(())
    }

    fn run(&mut self) -> RunOutcome {
        let started = self.clock.elapsed();
        if let Err(err) = remove_stale(&self.output_path()) {
            return self.failed(started, format!("clearing stale output: {err}"));
        }

        let directory = self.deck.directory().to_path_buf();
        let job = match self.scheduler.submit(&directory, &self.options.script_name) {
            Ok(job) => job,
            Err(err) => return self.failed(started, format!("submission failed: {err}")),
        };
        info!("{}: submitted job {job}", self.name);
        self.last_job = Some(job.clone());

        let state = match self.wait_for(&job, started) {
            Ok(Some(state)) => state,
            Ok(None) => {
                if let Err(err) = self.scheduler.cancel(&job) {
                    warn!("{}: could not cancel job {job}: {err}", self.name);
                }
                let waited = self.clock.elapsed().saturating_sub(started);
                warn!("{}: gave up on job {job} after {waited:?}", self.name);
                return RunOutcome::new(RunStatus::TimedOut).with_duration(waited);
            }
            Err(err) => return self.failed(started, format!("polling job {job} failed: {err}")),
        };

        let duration = self.clock.elapsed().saturating_sub(started);
        let stdout = capture(&directory, self.options.stdout_file.as_deref(), &job);
        let log = capture(&directory, self.options.log_file.as_deref(), &job);
        debug!("{}: job {job} ended {state:?} after {duration:?}", self.name);
        RunOutcome::new(state.run_status())
            .with_output(stdout, log)
            .with_duration(duration)
    }

    fn parse_output(&self) -> std::result::Result<Observation, CalculationFailure> {
        read_observation(&self.output_path())
    }
}
