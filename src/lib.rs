//! Convergence studies for calculations driven by a single varied input parameter.
//!
//! A convergence study re-runs an external calculation for each value of an
//! ordered input series (a basis-set cutoff, a k-point grid, a number of
//! empty states, ...) and stops once successive outputs agree within a
//! threshold. This crate provides
//!
//! - the [`Calculation`] contract and three implementations: a synthetic
//!   decaying exponential (`synthetic` module), a program run in a working
//!   directory (`process` module), and a batch-queue job polled through an
//!   explicit scheduler and clock (`queue` module),
//! - [`ConvergenceCriteria`], which validates result keys before handing the
//!   comparison to a pluggable [`Comparison`] policy (`criteria` and `metrics`
//!   modules),
//! - the convergence loop itself, [`converge`], and its per-iteration
//!   [`ConvergenceRecord`]s (`workflow` module).
//!
//! Failed runs never abort a study: they are recorded with `early_exit` set
//! and the loop returns. Errors are reserved for setup mistakes, such as a
//! result whose keys do not match the criteria.
//!
//! # Quick start
//!
//! ```no_run
//! use convflow::criteria::{ConvergenceCriteria, CriteriaSpec, CriterionDescriptor};
//! use convflow::options::SyntheticOptions;
//! use convflow::synthetic::SyntheticCalculation;
//! use convflow::workflow::converge;
//!
//! let spec = CriteriaSpec::new().with("value", CriterionDescriptor::absolute(1e-3));
//! let criteria = ConvergenceCriteria::new(vec![1.0, 2.0, 4.0, 8.0, 16.0], spec)
//!     .expect("at least two input values");
//! let mut calculation = SyntheticCalculation::new("decay", 0.0, SyntheticOptions::default());
//!
//! let report = converge(&mut calculation, &criteria, |x, calc: &mut SyntheticCalculation| {
//!     calc.set_input(*x);
//!     Ok(())
//! })
//! .expect("consistent results");
//! println!("converged at {:?} after {} runs", report.converged_value(), report.len());
//! ```
//!
//! The crate only uses the `log` facade; install a logger in the application
//! to see per-iteration diagnostics.

pub mod calculation;
pub mod criteria;
pub mod error;
pub mod metrics;
pub mod observation;
pub mod options;
pub mod process;
pub mod queue;
pub mod series;
pub mod synthetic;
pub mod workflow;

pub use calculation::Calculation;
pub use criteria::{Comparison, ConvergenceCriteria, CriteriaSpec, CriterionDescriptor, Verdict};
pub use error::{ConvergenceError, Result};
pub use observation::{CalculationFailure, CalculationResult, Observation, Quantity, RunOutcome};
pub use series::InputSeries;
pub use workflow::{converge, step, ConvergenceRecord, ConvergenceReport, LoopState};
