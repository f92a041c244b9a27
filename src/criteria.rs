//! Convergence criteria: key validation composed with a pluggable comparison policy.
//!
//! [`ConvergenceCriteria::evaluate`] always runs the same checks before any
//! comparison: a failed calculation stops the series, and successful results
//! must expose exactly the targets of the previous result and of the
//! [`CriteriaSpec`]. Only then is the [`Comparison`] consulted. Implementors
//! of [`Comparison`] therefore never see failures or mismatched key sets.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConvergenceError, Result};
use crate::metrics::{self, CurveRef, MetricError};
use crate::observation::{CalculationResult, Observation, Quantity};
use crate::options::ComparisonOptions;
use crate::series::InputSeries;

/// Outcome of comparing a result with its predecessor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// The result is within the convergence threshold.
    pub converged: bool,
    /// Iteration should stop for a reason other than convergence.
    pub early_exit: bool,
}

impl Verdict {
    pub fn new(converged: bool, early_exit: bool) -> Self {
        Self {
            converged,
            early_exit,
        }
    }

    pub fn converged() -> Self {
        Self::new(true, false)
    }

    pub fn continue_iterating() -> Self {
        Self::new(false, false)
    }

    pub fn early_exit() -> Self {
        Self::new(false, true)
    }

    /// True when the series should stop here.
    pub fn should_stop(&self) -> bool {
        self.converged || self.early_exit
    }
}

/// Built-in comparison kinds understood by [`SpecComparison`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CriterionKind {
    /// Absolute difference below the threshold.
    Absolute,
    /// Difference relative to the prior below the threshold.
    Relative,
    /// Log10 Spearman dissimilarity of two curves below the threshold.
    Spearman,
    /// Cosine similarity of two curves above the threshold.
    Cosine,
}

impl CriterionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Relative => "relative",
            Self::Spearman => "spearman",
            Self::Cosine => "cosine",
        }
    }

    /// Similarity metrics grow as results agree; distances shrink.
    pub fn is_similarity(&self) -> bool {
        matches!(self, Self::Cosine)
    }

    /// Applies this kind's fixed comparison direction.
    pub fn within(&self, metric: f64, threshold: f64) -> bool {
        if self.is_similarity() {
            metric > threshold
        } else {
            metric < threshold
        }
    }
}

impl FromStr for CriterionKind {
    type Err = String;

    fn from_str(kind: &str) -> std::result::Result<Self, Self::Err> {
        match kind.to_ascii_lowercase().as_str() {
            "absolute" => Ok(Self::Absolute),
            "relative" => Ok(Self::Relative),
            "spearman" => Ok(Self::Spearman),
            "cosine" => Ok(Self::Cosine),
            _ => Err(kind.to_string()),
        }
    }
}

/// Criterion applied to one target key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriterionDescriptor {
    /// Comparison name, resolved when the criterion is evaluated.
    pub kind: String,
    pub threshold: f64,
    /// Metric value past which further iteration is considered futile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divergence_limit: Option<f64>,
}

impl CriterionDescriptor {
    pub fn new(kind: impl Into<String>, threshold: f64) -> Self {
        Self {
            kind: kind.into(),
            threshold,
            divergence_limit: None,
        }
    }

    pub fn absolute(threshold: f64) -> Self {
        Self::new(CriterionKind::Absolute.name(), threshold)
    }

    pub fn relative(threshold: f64) -> Self {
        Self::new(CriterionKind::Relative.name(), threshold)
    }

    pub fn spearman(threshold: f64) -> Self {
        Self::new(CriterionKind::Spearman.name(), threshold)
    }

    pub fn cosine(threshold: f64) -> Self {
        Self::new(CriterionKind::Cosine.name(), threshold)
    }

    pub fn with_divergence_limit(mut self, limit: f64) -> Self {
        self.divergence_limit = Some(limit);
        self
    }
}

/// Mapping from target key to its criterion. Its keys are the expected keys of every result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriteriaSpec {
    targets: BTreeMap<String, CriterionDescriptor>,
}

impl CriteriaSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a criterion for `target`, returning the updated spec.
    pub fn with(mut self, target: impl Into<String>, criterion: CriterionDescriptor) -> Self {
        self.targets.insert(target.into(), criterion);
        self
    }

    pub fn get(&self, target: &str) -> Option<&CriterionDescriptor> {
        self.targets.get(target)
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CriterionDescriptor)> {
        self.targets.iter()
    }

    /// Decodes a spec from a JSON object of `{target: {kind, threshold, ...}}`.
    pub fn from_json_str(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }
}

impl<K: Into<String>> FromIterator<(K, CriterionDescriptor)> for CriteriaSpec {
    fn from_iter<I: IntoIterator<Item = (K, CriterionDescriptor)>>(iter: I) -> Self {
        Self {
            targets: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Criterion-specific comparison of two results whose key sets are already validated.
pub trait Comparison {
    fn compare(&self, spec: &CriteriaSpec, current: &Observation, prior: &Observation)
        -> Result<Verdict>;
}

impl<F> Comparison for F
where
    F: Fn(&CriteriaSpec, &Observation, &Observation) -> Result<Verdict>,
{
    fn compare(
        &self,
        spec: &CriteriaSpec,
        current: &Observation,
        prior: &Observation,
    ) -> Result<Verdict> {
        self(spec, current, prior)
    }
}

/// Evaluates every target with the criterion its descriptor names.
///
/// The series converges once every target converges, and exits early as soon
/// as any target passes its divergence limit.
#[derive(Clone, Debug, Default)]
pub struct SpecComparison {
    options: ComparisonOptions,
}

/// Per-target outcome, kept for logging and aggregation.
#[derive(Clone, Debug)]
struct TargetVerdict<'a> {
    target: &'a str,
    metric: f64,
    converged: bool,
    diverged: bool,
}

impl SpecComparison {
    pub fn new(options: ComparisonOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ComparisonOptions {
        &self.options
    }

    fn evaluate_target<'a>(
        &self,
        target: &'a str,
        criterion: &CriterionDescriptor,
        current: &Observation,
        prior: &Observation,
    ) -> Result<TargetVerdict<'a>> {
        let kind: CriterionKind =
            criterion
                .kind
                .parse()
                .map_err(|kind| ConvergenceError::UnknownCriterion {
                    target: target.to_string(),
                    kind,
                })?;

        // Key sets were validated by the caller.
        let (Some(current), Some(prior)) = (current.get(target), prior.get(target)) else {
            return Err(ConvergenceError::incompatible(
                target,
                kind.name(),
                "target missing from results",
            ));
        };

        let metric = self.measure(target, kind, current, prior)?;
        if metric.is_nan() {
            return Err(ConvergenceError::NumericalError {
                context: "criterion evaluation",
            });
        }

        let converged = kind.within(metric, criterion.threshold);
        let diverged = criterion
            .divergence_limit
            .is_some_and(|limit| !kind.within(metric, limit));
        debug!(
            "target `{target}`: {} = {metric:e} (threshold {:e}, converged {converged}, diverged {diverged})",
            kind.name(),
            criterion.threshold
        );

        Ok(TargetVerdict {
            target,
            metric,
            converged,
            diverged,
        })
    }

    fn measure(
        &self,
        target: &str,
        kind: CriterionKind,
        current: &Quantity,
        prior: &Quantity,
    ) -> Result<f64> {
        let floor = self.options.relative_floor;
        let metric_error = |err: MetricError| ConvergenceError::incompatible(target, kind.name(), err.to_string());

        match (current, prior) {
            (Quantity::Scalar(c), Quantity::Scalar(p)) => match kind {
                CriterionKind::Absolute => Ok((c - p).abs()),
                CriterionKind::Relative => Ok((c - p).abs() / p.abs().max(floor)),
                CriterionKind::Spearman | CriterionKind::Cosine => Err(
                    ConvergenceError::incompatible(target, kind.name(), "requires curves, found scalars"),
                ),
            },
            (Quantity::Curve { x: cx, y: cy }, Quantity::Curve { x: px, y: py }) => {
                let current = CurveRef::new(cx, cy).map_err(metric_error)?;
                let prior = CurveRef::new(px, py).map_err(metric_error)?;
                match kind {
                    CriterionKind::Absolute => metrics::max_abs_difference(current, prior),
                    CriterionKind::Relative => {
                        metrics::max_relative_difference(current, prior, floor)
                    }
                    CriterionKind::Spearman => metrics::spearman_dissimilarity(current, prior),
                    CriterionKind::Cosine => metrics::cosine_similarity(current, prior),
                }
                .map_err(metric_error)
            }
            (current, prior) => Err(ConvergenceError::incompatible(
                target,
                kind.name(),
                format!("cannot compare a {} with a {}", current.kind(), prior.kind()),
            )),
        }
    }
}

impl Comparison for SpecComparison {
    fn compare(
        &self,
        spec: &CriteriaSpec,
        current: &Observation,
        prior: &Observation,
    ) -> Result<Verdict> {
        let outcomes: Vec<Result<TargetVerdict<'_>>> = if self.options.parallel {
            spec.targets
                .par_iter()
                .map(|(target, criterion)| self.evaluate_target(target, criterion, current, prior))
                .collect()
        } else {
            spec.targets
                .iter()
                .map(|(target, criterion)| self.evaluate_target(target, criterion, current, prior))
                .collect()
        };
        // Report the first failing target in key order, whatever finished first.
        let outcomes = outcomes.into_iter().collect::<Result<Vec<_>>>()?;

        let converged = outcomes.iter().all(|outcome| outcome.converged);
        let early_exit = outcomes.iter().any(|outcome| outcome.diverged);
        if let Some(diverged) = outcomes.iter().find(|outcome| outcome.diverged) {
            debug!(
                "target `{}` diverged with metric {:e}",
                diverged.target, diverged.metric
            );
        }
        Ok(Verdict::new(converged, early_exit))
    }
}

/// Input series to iterate over plus the criteria deciding when to stop.
#[derive(Clone, Debug)]
pub struct ConvergenceCriteria<T, C = SpecComparison> {
    input: InputSeries<T>,
    criteria: CriteriaSpec,
    comparison: C,
}

impl<T> ConvergenceCriteria<T, SpecComparison> {
    /// Validates the input series and pairs it with the built-in comparison.
    pub fn new(input: Vec<T>, criteria: CriteriaSpec) -> Result<Self> {
        Ok(Self::from_series(InputSeries::new(input)?, criteria))
    }

    pub fn from_series(input: InputSeries<T>, criteria: CriteriaSpec) -> Self {
        Self {
            input,
            criteria,
            comparison: SpecComparison::default(),
        }
    }
}

impl<T: serde::de::DeserializeOwned> ConvergenceCriteria<T, SpecComparison> {
    /// Builds criteria from JSON fragments for the input series and the spec.
    pub fn from_json(input: Value, criteria: Value) -> Result<Self> {
        let input = InputSeries::from_json(input)?;
        let criteria: CriteriaSpec = serde_json::from_value(criteria)?;
        Ok(Self::from_series(input, criteria))
    }
}

impl<T, C: Comparison> ConvergenceCriteria<T, C> {
    /// Replaces the comparison policy, keeping the validated series and spec.
    pub fn with_comparison<D: Comparison>(self, comparison: D) -> ConvergenceCriteria<T, D> {
        ConvergenceCriteria {
            input: self.input,
            criteria: self.criteria,
            comparison,
        }
    }

    pub fn input(&self) -> &InputSeries<T> {
        &self.input
    }

    pub fn criteria(&self) -> &CriteriaSpec {
        &self.criteria
    }

    pub fn comparison(&self) -> &C {
        &self.comparison
    }

    /// Decides whether `current` has converged relative to the last successful result.
    ///
    /// A failed calculation yields `Verdict { converged: false, early_exit: true }`
    /// without consulting the comparison.
    ///
    /// # Errors
    ///
    /// [`ConvergenceError::InconsistentResultKeys`] when `current` and `prior`
    /// expose different targets, [`ConvergenceError::CriteriaKeyMismatch`] when
    /// they differ from the spec, and any error raised by the comparison.
    pub fn evaluate(&self, current: &CalculationResult, prior: &Observation) -> Result<Verdict> {
        let current = match current {
            CalculationResult::Failure(_) => return Ok(Verdict::early_exit()),
            CalculationResult::Success(observation) => observation,
        };

        let current_keys = current.key_set();
        let prior_keys = prior.key_set();
        if current_keys != prior_keys {
            return Err(ConvergenceError::InconsistentResultKeys {
                current: current_keys,
                prior: prior_keys,
            });
        }

        let criteria_keys = self.criteria.key_set();
        if current_keys != criteria_keys {
            return Err(ConvergenceError::CriteriaKeyMismatch {
                result: current_keys,
                criteria: criteria_keys,
            });
        }

        self.comparison.compare(&self.criteria, current, prior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{CalculationFailure, RunOutcome};
    use serde_json::json;

    fn energy_criteria(threshold: f64) -> ConvergenceCriteria<f64> {
        let spec = CriteriaSpec::new().with("energy", CriterionDescriptor::absolute(threshold));
        ConvergenceCriteria::new(vec![1.0, 2.0, 3.0], spec).unwrap()
    }

    fn energy(value: f64) -> Observation {
        Observation::new().with("energy", value)
    }

    #[test]
    fn construction_rejects_short_series() {
        let spec = CriteriaSpec::new().with("energy", CriterionDescriptor::absolute(1e-3));
        let err = ConvergenceCriteria::new(vec![1.0], spec).unwrap_err();
        assert!(matches!(err, ConvergenceError::InvalidInputSeries { len: 1 }));
    }

    #[test]
    fn construction_from_json_rejects_non_sequences() {
        let err = ConvergenceCriteria::<f64>::from_json(
            json!("1, 2, 3"),
            json!({"energy": {"kind": "absolute", "threshold": 1e-3}}),
        )
        .unwrap_err();
        assert!(matches!(err, ConvergenceError::NotIterable { .. }));
    }

    #[test]
    fn failed_run_stops_without_converging() {
        let criteria = energy_criteria(1e-3);
        let failed = CalculationResult::Failure(CalculationFailure::Run(RunOutcome::failed(2)));
        let verdict = criteria.evaluate(&failed, &energy(1.0)).unwrap();
        assert_eq!(verdict, Verdict::early_exit());
    }

    #[test]
    fn prior_key_mismatch_is_reported_before_criteria_mismatch() {
        let criteria = energy_criteria(1e-3);
        let current = CalculationResult::Success(Observation::new().with("gap", 1.0));
        let err = criteria.evaluate(&current, &energy(1.0)).unwrap_err();
        assert!(matches!(err, ConvergenceError::InconsistentResultKeys { .. }));
    }

    #[test]
    fn criteria_key_mismatch_is_reported() {
        let criteria = energy_criteria(1e-3);
        let current = CalculationResult::Success(energy(1.0).with("gap", 0.5));
        let prior = energy(1.0).with("gap", 0.4);
        let err = criteria.evaluate(&current, &prior).unwrap_err();
        assert!(matches!(err, ConvergenceError::CriteriaKeyMismatch { .. }));
    }

    #[test]
    fn absolute_threshold_decides_convergence() {
        let criteria = energy_criteria(1e-3);
        let close = criteria
            .evaluate(&energy(1.0005).into(), &energy(1.0))
            .unwrap();
        assert_eq!(close, Verdict::converged());

        let far = criteria.evaluate(&energy(1.1).into(), &energy(1.0)).unwrap();
        assert_eq!(far, Verdict::continue_iterating());
    }

    #[test]
    fn unknown_kind_is_a_hard_error() {
        let spec = CriteriaSpec::new().with("energy", CriterionDescriptor::new("simmeasxas", 0.9));
        let criteria = ConvergenceCriteria::new(vec![1, 2], spec).unwrap();
        let err = criteria
            .evaluate(&energy(1.0).into(), &energy(1.0))
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::UnknownCriterion { .. }));
    }

    #[test]
    fn cosine_converges_above_threshold() {
        let spec = CriteriaSpec::new().with("spectrum", CriterionDescriptor::cosine(0.99));
        let criteria = ConvergenceCriteria::new(vec![1, 2], spec).unwrap();
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let current = Observation::new().with("spectrum", Quantity::curve(x.clone(), vec![1.0, 2.0, 3.0, 4.0]));
        let prior = Observation::new().with("spectrum", Quantity::curve(x, vec![1.1, 2.0, 2.9, 4.1]));

        let verdict = criteria.evaluate(&current.into(), &prior).unwrap();
        assert!(verdict.converged);
        assert!(!verdict.early_exit);
    }

    #[test]
    fn divergence_limit_triggers_early_exit() {
        let spec = CriteriaSpec::new().with(
            "energy",
            CriterionDescriptor::absolute(1e-3).with_divergence_limit(10.0),
        );
        let criteria = ConvergenceCriteria::new(vec![1.0, 2.0], spec).unwrap();
        let verdict = criteria
            .evaluate(&energy(50.0).into(), &energy(1.0))
            .unwrap();
        assert_eq!(verdict, Verdict::early_exit());
    }

    #[test]
    fn all_targets_must_converge() {
        let spec = CriteriaSpec::new()
            .with("energy", CriterionDescriptor::absolute(1e-3))
            .with("gap", CriterionDescriptor::relative(1e-2));
        let criteria = ConvergenceCriteria::new(vec![1, 2], spec).unwrap();

        let prior = energy(1.0).with("gap", 2.0);
        let one_off = energy(1.0).with("gap", 2.5);
        assert!(!criteria.evaluate(&one_off.into(), &prior).unwrap().converged);

        let both = energy(1.0001).with("gap", 2.001);
        assert!(criteria.evaluate(&both.into(), &prior).unwrap().converged);
    }

    #[test]
    fn scalar_and_curve_are_incompatible() {
        let spec = CriteriaSpec::new().with("spectrum", CriterionDescriptor::spearman(-2.0));
        let criteria = ConvergenceCriteria::new(vec![1, 2], spec).unwrap();
        let current = Observation::new().with("spectrum", 1.0);
        let err = criteria.evaluate(&current.clone().into(), &current).unwrap_err();
        assert!(matches!(err, ConvergenceError::IncompatibleQuantity { .. }));
    }

    #[test]
    fn custom_comparison_replaces_built_in() {
        let criteria = energy_criteria(1e-3).with_comparison(
            |_: &CriteriaSpec, current: &Observation, prior: &Observation| -> Result<Verdict> {
                Ok(Verdict::new(current == prior, false))
            },
        );
        let verdict = criteria.evaluate(&energy(2.0).into(), &energy(2.0)).unwrap();
        assert!(verdict.converged);
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = CriteriaSpec::from_json_str(
            r#"{"spectrum": {"kind": "spearman", "threshold": -3.0, "divergence_limit": -0.5}}"#,
        )
        .unwrap();
        let descriptor = spec.get("spectrum").unwrap();
        assert_eq!(descriptor.kind, "spearman");
        assert_eq!(descriptor.divergence_limit, Some(-0.5));
    }
}
