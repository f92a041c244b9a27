//! The convergence loop: run a calculation over an input series until its output stabilizes.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::calculation::Calculation;
use crate::criteria::{Comparison, ConvergenceCriteria, Verdict};
use crate::error::Result;
use crate::observation::{CalculationFailure, CalculationResult, Observation};

/// Progress of a convergence series. The last three states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Initializing,
    Running,
    /// The criteria reported convergence.
    Converged,
    /// A run failed or the criteria asked to stop.
    EarlyExited,
    /// Every input value was tried without stopping.
    Exhausted,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::EarlyExited | Self::Exhausted)
    }
}

/// One iteration of a convergence series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord<T> {
    pub input_value: T,
    pub result: CalculationResult,
    pub converged: bool,
    pub early_exit: bool,
}

impl<T> ConvergenceRecord<T> {
    fn new(input_value: T, result: CalculationResult, verdict: Verdict) -> Self {
        Self {
            input_value,
            result,
            converged: verdict.converged,
            early_exit: verdict.early_exit,
        }
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::new(self.converged, self.early_exit)
    }
}

/// Ordered records of a finished series together with how it ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport<T> {
    records: Vec<ConvergenceRecord<T>>,
    state: LoopState,
}

#[allow(clippy::len_without_is_empty)]
impl<T> ConvergenceReport<T> {
    pub fn records(&self) -> &[ConvergenceRecord<T>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ConvergenceRecord<T>> {
        self.records
    }

    /// Terminal state of the loop.
    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn last(&self) -> Option<&ConvergenceRecord<T>> {
        self.records.last()
    }

    /// Input value at which the series converged, if it did.
    pub fn converged_value(&self) -> Option<&T> {
        match self.state {
            LoopState::Converged => self.records.last().map(|record| &record.input_value),
            _ => None,
        }
    }

    /// Observation of the last successful run.
    pub fn last_observation(&self) -> Option<&Observation> {
        self.records
            .iter()
            .rev()
            .find_map(|record| record.result.observation())
    }
}

/// Performs a single calculation of a convergence series.
///
/// `set_value_in_input` materializes `value` into the calculation, for example
/// by rewriting an input file. A failed run is returned as
/// [`CalculationResult::Failure`] without parsing output.
///
/// # Errors
///
/// Only errors raised by `set_value_in_input` are propagated.
pub fn step<T, C, F>(
    value: &T,
    calculation: &mut C,
    set_value_in_input: &mut F,
) -> Result<CalculationResult>
where
    C: Calculation + ?Sized,
    F: FnMut(&T, &mut C) -> Result<()>,
{
    set_value_in_input(value, calculation)?;
    let outcome = calculation.run();
    if !outcome.is_success() {
        return Ok(CalculationResult::Failure(CalculationFailure::Run(outcome)));
    }
    Ok(match calculation.parse_output() {
        Ok(observation) => CalculationResult::Success(observation),
        Err(failure) => CalculationResult::Failure(failure),
    })
}

/// Converges a calculation output with respect to an input parameter.
///
/// `calculation` writes its inputs once, then for each value of the criteria's
/// input series `set_value_in_input` is applied and the calculation is run.
/// Every result after the first is judged against the last successful result;
/// the loop stops as soon as a record is converged or asks for an early exit.
///
/// A failure of the first run ends the series immediately with a single
/// record marked `early_exit`. Running out of input values is not an error;
/// inspect [`ConvergenceReport::state`] to tell the outcomes apart.
///
/// # Errors
///
/// Configuration errors (inconsistent result keys, keys not matching the
/// criteria), criterion errors, failures to write inputs, and errors raised by
/// `set_value_in_input`. Failed runs are recorded, not returned as errors.
pub fn converge<T, C, K, F>(
    calculation: &mut C,
    criteria: &ConvergenceCriteria<T, K>,
    mut set_value_in_input: F,
) -> Result<ConvergenceReport<T>>
where
    T: Clone + std::fmt::Debug,
    C: Calculation + ?Sized,
    K: Comparison,
    F: FnMut(&T, &mut C) -> Result<()>,
{
    let series = criteria.input();
    let mut state = LoopState::Initializing;
    info!("starting convergence series over {} input values", series.len());

    calculation.write_inputs()?;
    transition(&mut state, LoopState::Running);

    let first_value = series.first();
    let first = step(first_value, calculation, &mut set_value_in_input)?;
    let mut prior = match &first {
        CalculationResult::Success(observation) => observation.clone(),
        CalculationResult::Failure(failure) => {
            warn!("first calculation at {first_value:?} failed: {failure}");
            transition(&mut state, LoopState::EarlyExited);
            return Ok(ConvergenceReport {
                records: vec![ConvergenceRecord::new(
                    first_value.clone(),
                    first,
                    Verdict::early_exit(),
                )],
                state,
            });
        }
    };
    debug!("iteration 1 at {first_value:?}: {prior:?}");

    let mut records = Vec::with_capacity(series.len());
    records.push(ConvergenceRecord::new(
        first_value.clone(),
        first,
        Verdict::continue_iterating(),
    ));

    for (offset, value) in series.rest().iter().enumerate() {
        let iteration = offset + 2;
        let result = step(value, calculation, &mut set_value_in_input)?;
        let verdict = criteria.evaluate(&result, &prior)?;

        match &result {
            CalculationResult::Success(observation) => {
                debug!("iteration {iteration} at {value:?}: {observation:?} -> {verdict:?}");
                prior = observation.clone();
            }
            CalculationResult::Failure(failure) => {
                warn!("calculation {iteration} at {value:?} failed: {failure}");
            }
        }

        records.push(ConvergenceRecord::new(value.clone(), result, verdict));
        if verdict.should_stop() {
            let terminal = if verdict.converged {
                LoopState::Converged
            } else {
                LoopState::EarlyExited
            };
            transition(&mut state, terminal);
            return Ok(ConvergenceReport { records, state });
        }
    }

    transition(&mut state, LoopState::Exhausted);
    Ok(ConvergenceReport { records, state })
}

fn transition(state: &mut LoopState, next: LoopState) {
    debug!("convergence loop {state:?} -> {next:?}");
    if next.is_terminal() {
        info!("convergence series finished: {next:?}");
    }
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{CriteriaSpec, CriterionDescriptor};
    use crate::error::ConvergenceError;
    use crate::observation::{Quantity, RunOutcome};
    use std::collections::VecDeque;

    /// Calculation replaying a scripted sequence of results.
    #[derive(Default)]
    struct Replay {
        script: VecDeque<std::result::Result<Observation, CalculationFailure>>,
        pending: Option<std::result::Result<Observation, CalculationFailure>>,
        inputs_written: usize,
        values: Vec<i32>,
    }

    impl Replay {
        fn new(script: Vec<std::result::Result<Observation, CalculationFailure>>) -> Self {
            Self {
                script: script.into(),
                ..Self::default()
            }
        }
    }

    impl Calculation for Replay {
        fn write_inputs(&mut self) -> Result<()> {
            self.inputs_written += 1;
            Ok(())
        }

        fn run(&mut self) -> RunOutcome {
            match self.script.pop_front() {
                Some(Err(CalculationFailure::Run(outcome))) => outcome,
                Some(next) => {
                    self.pending = Some(next);
                    RunOutcome::success()
                }
                None => RunOutcome::failed(99),
            }
        }

        fn parse_output(&self) -> std::result::Result<Observation, CalculationFailure> {
            self.pending
                .clone()
                .unwrap_or_else(|| Err(CalculationFailure::missing_output("replay", "nothing ran")))
        }
    }

    fn x(value: f64) -> std::result::Result<Observation, CalculationFailure> {
        Ok(Observation::new().with("x", value))
    }

    fn record_value(value: &i32, calculation: &mut Replay) -> Result<()> {
        calculation.values.push(*value);
        Ok(())
    }

    fn criteria(values: Vec<i32>, threshold: f64) -> ConvergenceCriteria<i32> {
        let spec = CriteriaSpec::new().with("x", CriterionDescriptor::absolute(threshold));
        ConvergenceCriteria::new(values, spec).unwrap()
    }

    #[test]
    fn stops_at_first_converged_record() {
        let mut calculation = Replay::new(vec![x(10.0), x(5.0), x(5.0), x(5.0)]);
        let report = converge(&mut calculation, &criteria(vec![1, 2, 3, 4], 1e-9), record_value)
            .unwrap();

        assert_eq!(report.state(), LoopState::Converged);
        assert_eq!(report.len(), 3);
        assert_eq!(report.converged_value(), Some(&3));
        assert_eq!(calculation.values, vec![1, 2, 3]);
        assert_eq!(calculation.inputs_written, 1);
    }

    #[test]
    fn exhausts_series_without_convergence() {
        let mut calculation = Replay::new(vec![x(1.0), x(2.0), x(3.0)]);
        let report = converge(&mut calculation, &criteria(vec![1, 2, 3], 1e-3), record_value)
            .unwrap();

        assert_eq!(report.state(), LoopState::Exhausted);
        assert_eq!(report.len(), 3);
        assert!(report.records().iter().all(|r| !r.converged && !r.early_exit));
        assert_eq!(report.converged_value(), None);
    }

    #[test]
    fn first_failure_is_a_single_early_exit_record() {
        let failure = CalculationFailure::Run(RunOutcome::failed(1));
        let mut calculation = Replay::new(vec![Err(failure), x(1.0)]);
        let report = converge(&mut calculation, &criteria(vec![1, 2], 1e-3), record_value)
            .unwrap();

        assert_eq!(report.state(), LoopState::EarlyExited);
        assert_eq!(report.len(), 1);
        let record = &report.records()[0];
        assert_eq!(record.input_value, 1);
        assert!(record.early_exit);
        assert!(!record.converged);
    }

    #[test]
    fn later_missing_output_ends_series() {
        let missing = CalculationFailure::missing_output("out.json", "file not found");
        let mut calculation = Replay::new(vec![x(1.0), Err(missing.clone()), x(1.0)]);
        let report = converge(&mut calculation, &criteria(vec![1, 2, 3], 1e-3), record_value)
            .unwrap();

        assert_eq!(report.state(), LoopState::EarlyExited);
        assert_eq!(report.len(), 2);
        assert_eq!(report.records()[1].result, CalculationResult::Failure(missing));
        assert_eq!(report.last_observation(), Some(&Observation::new().with("x", 1.0)));
    }

    #[test]
    fn inconsistent_keys_abort_the_loop() {
        let mut calculation = Replay::new(vec![
            x(1.0),
            Ok(Observation::new().with("y", 1.0)),
            x(1.0),
        ]);
        let err = converge(&mut calculation, &criteria(vec![1, 2, 3], 1e-3), record_value)
            .unwrap_err();

        assert!(matches!(err, ConvergenceError::InconsistentResultKeys { .. }));
        assert_eq!(calculation.values, vec![1, 2]);
    }

    #[test]
    fn mutate_errors_propagate() {
        let mut calculation = Replay::new(vec![x(1.0), x(1.0)]);
        let err = converge(&mut calculation, &criteria(vec![1, 2], 1e-3), |_: &i32, _: &mut Replay| {
            Err(ConvergenceError::io(
                "rewriting input",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        })
        .unwrap_err();
        assert!(matches!(err, ConvergenceError::Io { .. }));
    }

    #[test]
    fn step_skips_parsing_after_failed_run() {
        let mut calculation = Replay::new(vec![Err(CalculationFailure::Run(RunOutcome::failed(4)))]);
        let mut mutate = record_value;
        let result = step(&7, &mut calculation, &mut mutate).unwrap();

        assert_eq!(
            result.failure().and_then(CalculationFailure::outcome).and_then(RunOutcome::code),
            Some(4)
        );
        assert_eq!(calculation.values, vec![7]);
    }

    #[test]
    fn report_serializes_records() {
        let mut calculation = Replay::new(vec![x(2.0), x(2.0)]);
        let report = converge(&mut calculation, &criteria(vec![1, 2], 1e-3), record_value)
            .unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["state"], "converged");
        assert_eq!(json["records"][1]["converged"], true);
        assert_eq!(
            report.records()[1].result.observation().and_then(|o| o.get("x")),
            Some(&Quantity::Scalar(2.0))
        );
    }
}
