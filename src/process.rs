//! File-based calculation that runs an external program in its own working directory.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::Instant;

use log::{debug, warn};

use crate::calculation::{read_observation, remove_stale, Calculation, InputDeck};
use crate::error::Result;
use crate::observation::{CalculationFailure, Observation, RunOutcome, RunStatus};

/// Writes a `key = value` input file, runs a program next to it, and reads a JSON result file.
#[derive(Clone, Debug)]
pub struct ProcessCalculation {
    name: String,
    deck: InputDeck,
    program: String,
    args: Vec<String>,
    output_file: String,
}

impl ProcessCalculation {
    /// Creates the calculation, making its working directory if needed.
    pub fn new(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        program: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            deck: InputDeck::new(directory, "input.txt")?,
            program: program.into(),
            args: Vec::new(),
            output_file: "output.json".to_string(),
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Renames the input file. Parameters set earlier are discarded.
    pub fn with_input_file(mut self, file_name: impl Into<String>) -> Result<Self> {
        self.deck = InputDeck::new(self.deck.directory().to_path_buf(), file_name)?;
        Ok(self)
    }

    pub fn with_output_file(mut self, file_name: impl Into<String>) -> Self {
        self.output_file = file_name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        self.deck.directory()
    }

    pub fn deck(&self) -> &InputDeck {
        &self.deck
    }

    /// Sets an input parameter, rewriting the input file if it already exists.
    pub fn set_parameter(
        &mut self,
        key: impl Into<String>,
        value: impl std::fmt::Display,
    ) -> Result<()> {
        self.deck.set(key, value)
    }

    pub fn output_path(&self) -> PathBuf {
        self.deck.directory().join(&self.output_file)
    }
}

impl Calculation for ProcessCalculation {
    fn write_inputs(&mut self) -> Result<()> {
        self.deck.write()?;
        debug!("{}: wrote {}", self.name, self.deck.path().display());
        Ok(())
    }

    fn run(&mut self) -> RunOutcome {
        if let Err(err) = remove_stale(&self.output_path()) {
            return RunOutcome::failed(-1)
                .with_output("", format!("clearing stale output: {err}"));
        }

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(self.deck.directory())
            .output();
        let duration = started.elapsed();

        match output {
            Ok(output) => {
                let outcome = RunOutcome::new(exit_status(output.status))
                    .with_output(
                        String::from_utf8_lossy(&output.stdout),
                        String::from_utf8_lossy(&output.stderr),
                    )
                    .with_duration(duration);
                debug!(
                    "{}: `{}` finished with {:?} in {duration:?}",
                    self.name, self.program, outcome.status
                );
                outcome
            }
            Err(err) => {
                warn!("{}: could not start `{}`: {err}", self.name, self.program);
                RunOutcome::failed(-1)
                    .with_output("", format!("failed to start `{}`: {err}", self.program))
                    .with_duration(duration)
            }
        }
    }

    fn parse_output(&self) -> std::result::Result<Observation, CalculationFailure> {
        read_observation(&self.output_path())
    }
}

fn exit_status(status: ExitStatus) -> RunStatus {
    if status.success() {
        return RunStatus::Success;
    }
    if let Some(code) = status.code() {
        return RunStatus::Failed(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return RunStatus::Signalled(signal);
        }
    }
    RunStatus::Failed(-1)
}
