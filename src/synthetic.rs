//! A self-contained calculation that reports `exp(-x) + offset`, for demonstrations and tests.

use log::debug;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::calculation::Calculation;
use crate::error::Result;
use crate::observation::{CalculationFailure, Observation, RunOutcome};
use crate::options::SyntheticOptions;

/// Decaying exponential in the input value, optionally perturbed by seeded Gaussian noise.
///
/// The result approaches `offset` as the input grows, so a series of growing
/// inputs converges under an absolute criterion.
#[derive(Clone, Debug)]
pub struct SyntheticCalculation {
    name: String,
    input: f64,
    options: SyntheticOptions,
    rng: SmallRng,
    runs: usize,
    output: Option<f64>,
}

impl SyntheticCalculation {
    pub fn new(name: impl Into<String>, input: f64, options: SyntheticOptions) -> Self {
        let rng = SmallRng::seed_from_u64(options.seed);
        Self {
            name: name.into(),
            input,
            options,
            rng,
            runs: 0,
            output: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> f64 {
        self.input
    }

    pub fn set_input(&mut self, input: f64) {
        self.input = input;
    }

    /// Number of times `run` has been called.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Noise-free value for `input`.
    pub fn exact(&self, input: f64) -> f64 {
        (-input).exp() + self.options.offset
    }
}

impl Calculation for SyntheticCalculation {
    fn write_inputs(&mut self) -> Result<()> {
        self.output = None;
        debug!("{}: prepared synthetic calculation at x = {}", self.name, self.input);
        Ok(())
    }

    fn run(&mut self) -> RunOutcome {
        self.runs += 1;
        self.output = None;
        if self.options.fail_on_run == Some(self.runs) {
            return RunOutcome::failed(1).with_output("", format!("{}: injected failure", self.name));
        }

        let mut value = self.exact(self.input);
        if self.options.noise > 0.0 {
            let draw: f64 = StandardNormal.sample(&mut self.rng);
            value += self.options.noise * draw;
        }
        self.output = Some(value);
        RunOutcome::success().with_output(value.to_string(), "")
    }

    fn parse_output(&self) -> std::result::Result<Observation, CalculationFailure> {
        let value = self
            .output
            .ok_or_else(|| CalculationFailure::missing_output(self.name.clone(), "no result recorded"))?;
        Ok(Observation::new().with(self.options.target.clone(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::Quantity;
    use approx::assert_relative_eq;

    #[test]
    fn reports_decaying_exponential() {
        let mut calculation = SyntheticCalculation::new("decay", 4.2, SyntheticOptions::default());
        calculation.write_inputs().unwrap();
        assert!(calculation.run().is_success());

        let observation = calculation.parse_output().unwrap();
        let value = observation.get("value").and_then(Quantity::as_scalar).unwrap();
        assert_relative_eq!(value, 1.514_995_576_820_477_7, epsilon = 1e-12);
    }

    #[test]
    fn injected_failure_leaves_no_output() {
        let options = SyntheticOptions::default().failing_on_run(2);
        let mut calculation = SyntheticCalculation::new("decay", 1.0, options);
        assert!(calculation.run().is_success());
        assert!(!calculation.run().is_success());
        assert!(calculation.parse_output().is_err());
        assert!(calculation.run().is_success());
    }

    #[test]
    fn noise_is_reproducible_for_a_seed() {
        let options = SyntheticOptions::default().with_noise(0.1, 99);
        let mut a = SyntheticCalculation::new("a", 2.0, options.clone());
        let mut b = SyntheticCalculation::new("b", 2.0, options);
        a.run();
        b.run();
        assert_eq!(a.parse_output().unwrap(), b.parse_output().unwrap());
    }
}
