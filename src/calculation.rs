//! The calculation contract consumed by the convergence loop, plus shared file helpers.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{ConvergenceError, Result};
use crate::observation::{CalculationFailure, Observation, RunOutcome};

/// One unit of "prepare, run, and read back a result".
///
/// The convergence loop calls [`write_inputs`](Calculation::write_inputs) once,
/// then alternates between mutating the calculation, [`run`](Calculation::run)
/// and, for successful runs only, [`parse_output`](Calculation::parse_output).
pub trait Calculation {
    /// Prepares whatever persistent state the run needs.
    fn write_inputs(&mut self) -> Result<()>;

    /// Executes the calculation. May block for as long as the work takes.
    fn run(&mut self) -> RunOutcome;

    /// Reads the result of the last successful run.
    ///
    /// Missing or unreadable output is reported as
    /// [`CalculationFailure::MissingOutput`], which the loop records like a
    /// failed run.
    fn parse_output(&self) -> std::result::Result<Observation, CalculationFailure>;
}

impl<C: Calculation + ?Sized> Calculation for Box<C> {
    fn write_inputs(&mut self) -> Result<()> {
        (**self).write_inputs()
    }

    fn run(&mut self) -> RunOutcome {
        (**self).run()
    }

    fn parse_output(&self) -> std::result::Result<Observation, CalculationFailure> {
        (**self).parse_output()
    }
}

/// A plain-text input file of `key = value` lines inside a working directory.
#[derive(Clone, Debug)]
pub struct InputDeck {
    directory: PathBuf,
    file_name: String,
    parameters: BTreeMap<String, String>,
    written: bool,
}

impl InputDeck {
    /// Creates the working directory if it does not exist yet.
    pub fn new(directory: impl Into<PathBuf>, file_name: impl Into<String>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|err| {
            ConvergenceError::io(format!("creating {}", directory.display()), err)
        })?;
        Ok(Self {
            directory,
            file_name: file_name.into(),
            parameters: BTreeMap::new(),
            written: false,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Sets a parameter. Once the deck has been written, the file is rewritten immediately.
    pub fn set(&mut self, key: impl Into<String>, value: impl Display) -> Result<()> {
        self.parameters.insert(key.into(), value.to_string());
        if self.written {
            self.write()?;
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{key} = {value}\n"))
            .collect()
    }

    pub fn write(&mut self) -> Result<()> {
        let path = self.path();
        fs::write(&path, self.render())
            .map_err(|err| ConvergenceError::io(format!("writing {}", path.display()), err))?;
        self.written = true;
        Ok(())
    }
}

/// Reads a JSON object of target values from `path`.
pub fn read_observation(path: &Path) -> std::result::Result<Observation, CalculationFailure> {
    let location = path.display().to_string();
    let contents = fs::read_to_string(path).map_err(|err| {
        let reason = match err.kind() {
            ErrorKind::NotFound => "file not found".to_string(),
            _ => err.to_string(),
        };
        CalculationFailure::missing_output(location.clone(), reason)
    })?;
    serde_json::from_str(&contents).map_err(|err| {
        CalculationFailure::missing_output(location, format!("malformed output: {err}"))
    })
}

/// Deletes a previous run's output. A missing file is not an error.
pub(crate) fn remove_stale(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
