//! Measured quantities, run outcomes, and the tagged result of a single calculation.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A measured value for one target of a calculation.
///
/// Deserialized untagged: a JSON number is a scalar and an object with `x` and
/// `y` arrays is a curve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Scalar(f64),
    Curve { x: Vec<f64>, y: Vec<f64> },
}

impl Quantity {
    /// Builds a curve from abscissae and ordinates.
    pub fn curve(x: Vec<f64>, y: Vec<f64>) -> Self {
        Self::Curve { x, y }
    }

    /// Returns the scalar value, if this is a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::Curve { .. } => None,
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Curve { .. } => "curve",
        }
    }
}

impl From<f64> for Quantity {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

/// Named target values produced by one successful calculation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Observation {
    values: BTreeMap<String, Quantity>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target value, returning the updated observation.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Quantity>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Quantity>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Quantity> {
        self.values.get(key)
    }

    /// Set of target keys, compared against the prior result and the criteria.
    pub fn key_set(&self) -> BTreeSet<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.values.iter()
    }
}

impl<K: Into<String>, V: Into<Quantity>> FromIterator<(K, V)> for Observation {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Terminal status reported by a calculation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed(i32),
    TimedOut,
    Cancelled,
    Signalled(i32),
}

/// Diagnostics captured from one execution of a calculation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RunOutcome {
    /// An outcome with the given status and empty captured output.
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn success() -> Self {
        Self::new(RunStatus::Success)
    }

    pub fn failed(code: i32) -> Self {
        Self::new(RunStatus::Failed(code))
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Exit code, when the run terminated with one.
    pub fn code(&self) -> Option<i32> {
        match self.status {
            RunStatus::Success => Some(0),
            RunStatus::Failed(code) => Some(code),
            RunStatus::TimedOut | RunStatus::Cancelled | RunStatus::Signalled(_) => None,
        }
    }
}

/// Why a calculation produced no usable observation.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationFailure {
    /// The run itself reported failure.
    #[error("calculation run failed with status {:?}", .0.status)]
    Run(RunOutcome),

    /// The run succeeded but its output could not be read.
    #[error("missing output {location}: {reason}")]
    MissingOutput { location: String, reason: String },
}

impl CalculationFailure {
    pub fn missing_output(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingOutput {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// The run outcome behind this failure, if the run itself failed.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        match self {
            Self::Run(outcome) => Some(outcome),
            Self::MissingOutput { .. } => None,
        }
    }
}

/// Either the observation of a successful calculation or the reason it failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationResult {
    Success(Observation),
    Failure(CalculationFailure),
}

impl CalculationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn observation(&self) -> Option<&Observation> {
        match self {
            Self::Success(observation) => Some(observation),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&CalculationFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

impl From<Observation> for CalculationResult {
    fn from(observation: Observation) -> Self {
        Self::Success(observation)
    }
}

impl From<CalculationFailure> for CalculationResult {
    fn from(failure: CalculationFailure) -> Self {
        Self::Failure(failure)
    }
}
