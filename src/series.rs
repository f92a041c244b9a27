//! Ordered candidate values for the parameter being converged, and generators for common ladders.

use std::ops::Index;

use nalgebra::{Matrix3, Vector3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{ConvergenceError, Result};

/// Default upper bound on the number of k-points generated by [`k_grid_series`].
pub const DEFAULT_K_POINT_CUTOFF: u64 = 3400;

/// Largest number of 0.1 factor increments tried by [`k_grid_series`].
const MAX_K_GRID_STEPS: u32 = 100_000;

/// Validated, immutable sequence of input values. Always holds at least two entries.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "Vec<T>", bound(deserialize = "T: Deserialize<'de>"))]
pub struct InputSeries<T> {
    values: Vec<T>,
}

#[allow(clippy::len_without_is_empty)]
impl<T> InputSeries<T> {
    /// Creates a series, rejecting fewer than two values.
    pub fn new(values: Vec<T>) -> Result<Self> {
        if values.len() < 2 {
            return Err(ConvergenceError::InvalidInputSeries { len: values.len() });
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn first(&self) -> &T {
        &self.values[0]
    }

    /// Values after the first, in order.
    pub fn rest(&self) -> &[T] {
        &self.values[1..]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

impl<T: DeserializeOwned> InputSeries<T> {
    /// Builds a series from a JSON document fragment, which must be an array.
    pub fn from_json(value: Value) -> Result<Self> {
        let found = match &value {
            Value::Array(_) => None,
            Value::Null => Some("null"),
            Value::Bool(_) => Some("a boolean"),
            Value::Number(_) => Some("a number"),
            Value::String(_) => Some("a string"),
            Value::Object(_) => Some("an object"),
        };
        if let Some(found) = found {
            return Err(ConvergenceError::NotIterable {
                found: found.to_string(),
            });
        }
        let values: Vec<T> = serde_json::from_value(value)?;
        Self::new(values)
    }
}

impl<T> TryFrom<Vec<T>> for InputSeries<T> {
    type Error = ConvergenceError;

    fn try_from(values: Vec<T>) -> Result<Self> {
        Self::new(values)
    }
}

impl<T: Serialize> Serialize for InputSeries<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<T> Index<usize> for InputSeries<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.values[index]
    }
}

impl<'a, T> IntoIterator for &'a InputSeries<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

/// Generates a ladder of k-point grids of increasing density for a lattice.
///
/// Rows of `lattice` are the lattice vectors. Each grid is
/// `floor(factor / |a_i|)` along direction `i`, with `factor` stepping by 0.1.
/// Only distinct grids with a positive number of points are kept, and
/// generation stops once a grid reaches `cutoff` points.
///
/// # Errors
///
/// [`ConvergenceError::NumericalError`] for a degenerate lattice, for grids
/// too large to count (lattice vectors far too short, e.g. given in metres),
/// and when `cutoff` is not reached within the step budget (lattice vectors
/// far too long).
///
/// The ladder is heuristic: it does not account for symmetry reduction.
pub fn k_grid_series(lattice: &Matrix3<f64>, cutoff: u64) -> Result<InputSeries<[u32; 3]>> {
    let mut inverse_norms = Vector3::zeros();
    for (i, row) in lattice.row_iter().enumerate() {
        let norm = row.norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(ConvergenceError::NumericalError {
                context: "lattice vector norm",
            });
        }
        inverse_norms[i] = 1.0 / norm;
    }

    let mut grids = Vec::new();
    let mut current = [0u32; 3];
    let mut points = 0u64;

    for step in 0..MAX_K_GRID_STEPS {
        if points >= cutoff {
            break;
        }
        let factor = f64::from(step) * 0.1;
        let mut next = [0u32; 3];
        for (axis, n) in next.iter_mut().enumerate() {
            let divisions = (inverse_norms[axis] * factor).floor();
            if divisions > f64::from(u32::MAX) {
                return Err(ConvergenceError::NumericalError {
                    context: "k-grid divisions exceed u32",
                });
            }
            *n = divisions as u32;
        }
        if next != current {
            current = next;
            points = next
                .iter()
                .try_fold(1u64, |acc, &n| acc.checked_mul(u64::from(n)))
                .ok_or(ConvergenceError::NumericalError {
                    context: "k-grid point count overflows u64",
                })?;
            if points > 0 {
                grids.push(next);
            }
        }
    }
    if points < cutoff {
        return Err(ConvergenceError::NumericalError {
            context: "k-grid ladder did not reach the cutoff",
        });
    }

    log::debug!("generated {} k-grids up to {} points", grids.len(), points);
    InputSeries::new(grids)
}
