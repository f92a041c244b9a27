//! Similarity and distance metrics between scalar results and sampled curves.

use nalgebra::DVector;
use thiserror::Error;

/// Reasons a metric cannot be computed for the supplied data.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum MetricError {
    #[error("abscissae and ordinates differ in length ({x} != {y})")]
    RaggedCurve { x: usize, y: usize },

    #[error("curves differ in length ({left} != {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error("at least {required} points are required, found {found}")]
    TooFewPoints { required: usize, found: usize },

    #[error("abscissae must be strictly increasing")]
    Unsorted,

    #[error("abscissa {x} lies outside the interpolation range [{min}, {max}]")]
    OutOfBounds { x: f64, min: f64, max: f64 },

    #[error("metric is undefined for {context}")]
    Undefined { context: &'static str },
}

/// Borrowed view of a sampled curve `y(x)`.
#[derive(Clone, Copy, Debug)]
pub struct CurveRef<'a> {
    pub x: &'a [f64],
    pub y: &'a [f64],
}

impl<'a> CurveRef<'a> {
    /// Validates that `x` and `y` line up, hold at least two points, and `x` is increasing.
    pub fn new(x: &'a [f64], y: &'a [f64]) -> Result<Self, MetricError> {
        if x.len() != y.len() {
            return Err(MetricError::RaggedCurve {
                x: x.len(),
                y: y.len(),
            });
        }
        if x.len() < 2 {
            return Err(MetricError::TooFewPoints {
                required: 2,
                found: x.len(),
            });
        }
        if x.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(MetricError::Unsorted);
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Linearly interpolates this curve at each query abscissa.
    ///
    /// Queries outside `[x_min, x_max]` are rejected rather than extrapolated.
    pub fn interpolate(&self, queries: &[f64]) -> Result<DVector<f64>, MetricError> {
        let min = self.x[0];
        let max = self.x[self.x.len() - 1];
        let mut values = DVector::zeros(queries.len());

        for (slot, &query) in values.iter_mut().zip(queries) {
            if !(min..=max).contains(&query) {
                return Err(MetricError::OutOfBounds { x: query, min, max });
            }
            // partition_point finds the first knot strictly greater than the query.
            let upper = self
                .x
                .partition_point(|&knot| knot <= query)
                .min(self.x.len() - 1);
            let lower = upper - 1;
            let span = self.x[upper] - self.x[lower];
            let t = (query - self.x[lower]) / span;
            *slot = self.y[lower] + t * (self.y[upper] - self.y[lower]);
        }

        Ok(values)
    }

    fn ordinates(&self) -> DVector<f64> {
        DVector::from_column_slice(self.y)
    }
}

/// Fractional ranks (1-based) with ties sharing their average rank.
pub fn rank(values: &DVector<f64>) -> DVector<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = DVector::zeros(n);
    let mut start = 0usize;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end are tied; ranks are start+1..=end.
        let average = (start + end + 1) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = average;
        }
        start = end;
    }
    ranks
}

/// Pearson correlation coefficient.
pub fn pearson(a: &DVector<f64>, b: &DVector<f64>) -> Result<f64, MetricError> {
    if a.len() != b.len() {
        return Err(MetricError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.len() < 2 {
        return Err(MetricError::TooFewPoints {
            required: 2,
            found: a.len(),
        });
    }
    let da = a.add_scalar(-a.mean());
    let db = b.add_scalar(-b.mean());
    let denominator = da.norm() * db.norm();
    if denominator == 0.0 {
        return Err(MetricError::Undefined {
            context: "a constant series",
        });
    }
    Ok(da.dot(&db) / denominator)
}

/// Spearman rank correlation coefficient.
pub fn spearman(a: &DVector<f64>, b: &DVector<f64>) -> Result<f64, MetricError> {
    pearson(&rank(a), &rank(b))
}

/// Symmetric Spearman dissimilarity of two curves on a log10 scale.
///
/// Each curve is interpolated onto the other's abscissae and correlated with
/// the other's ordinates; the two coefficients are averaged and the result is
/// `log10(1 - mean)`. Identical shapes tend to negative infinity; smaller is more
/// similar.
pub fn spearman_dissimilarity(current: CurveRef<'_>, prior: CurveRef<'_>) -> Result<f64, MetricError> {
    let prior_on_current = prior.interpolate(current.x)?;
    let current_on_prior = current.interpolate(prior.x)?;

    let rho_current = spearman(&prior_on_current, &current.ordinates())?;
    let rho_prior = spearman(&current_on_prior, &prior.ordinates())?;

    let dissimilarity = 1.0 - 0.5 * (rho_current + rho_prior);
    Ok(dissimilarity.max(0.0).log10())
}

/// Cosine similarity between the current curve and the prior interpolated onto it.
pub fn cosine_similarity(current: CurveRef<'_>, prior: CurveRef<'_>) -> Result<f64, MetricError> {
    let prior_on_current = prior.interpolate(current.x)?;
    let current_y = current.ordinates();
    let denominator = current_y.norm() * prior_on_current.norm();
    if denominator == 0.0 {
        return Err(MetricError::Undefined {
            context: "a zero curve",
        });
    }
    Ok(current_y.dot(&prior_on_current) / denominator)
}

/// Largest pointwise absolute difference between two curves sampled on the same grid.
pub fn max_abs_difference(current: CurveRef<'_>, prior: CurveRef<'_>) -> Result<f64, MetricError> {
    if current.len() != prior.len() {
        return Err(MetricError::LengthMismatch {
            left: current.len(),
            right: prior.len(),
        });
    }
    let difference = current.ordinates() - prior.ordinates();
    Ok(difference.amax())
}

/// Largest pointwise relative difference, scaled by the prior's magnitude (floored at `floor`).
pub fn max_relative_difference(
    current: CurveRef<'_>,
    prior: CurveRef<'_>,
    floor: f64,
) -> Result<f64, MetricError> {
    if current.len() != prior.len() {
        return Err(MetricError::LengthMismatch {
            left: current.len(),
            right: prior.len(),
        });
    }
    Ok(current
        .y
        .iter()
        .zip(prior.y)
        .map(|(c, p)| (c - p).abs() / p.abs().max(floor))
        .fold(0.0, f64::max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * 0.25).collect()
    }

    #[test]
    fn ranks_average_ties() {
        let values = DVector::from_vec(vec![3.0, 1.0, 3.0, 2.0]);
        let ranks = rank(&values);
        assert_eq!(ranks.as_slice(), &[3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn interpolation_is_linear_and_bounded() {
        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 10.0, 30.0];
        let curve = CurveRef::new(&x, &y).unwrap();

        let values = curve.interpolate(&[0.5, 1.5, 2.0]).unwrap();
        assert_relative_eq!(values[0], 5.0);
        assert_relative_eq!(values[1], 20.0);
        assert_relative_eq!(values[2], 30.0);

        assert!(matches!(
            curve.interpolate(&[2.5]),
            Err(MetricError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn spearman_dissimilarity_of_identical_shapes_is_minimal() {
        let x = grid(20);
        let y: Vec<f64> = x.iter().map(|v| (-v).exp()).collect();
        let curve = CurveRef::new(&x, &y).unwrap();

        let score = spearman_dissimilarity(curve, curve).unwrap();
        assert!(score < -10.0);
    }

    #[test]
    fn spearman_dissimilarity_of_reversed_shapes_is_maximal() {
        let x = grid(10);
        let up: Vec<f64> = x.clone();
        let down: Vec<f64> = x.iter().map(|v| -v).collect();

        let score = spearman_dissimilarity(
            CurveRef::new(&x, &up).unwrap(),
            CurveRef::new(&x, &down).unwrap(),
        )
        .unwrap();
        assert_relative_eq!(score, 2.0_f64.log10(), epsilon = 1e-12);
    }

    #[test]
    fn cosine_similarity_ignores_scale() {
        let x = grid(8);
        let y: Vec<f64> = x.iter().map(|v| v + 1.0).collect();
        let scaled: Vec<f64> = y.iter().map(|v| v * 3.0).collect();

        let similarity = cosine_similarity(
            CurveRef::new(&x, &y).unwrap(),
            CurveRef::new(&x, &scaled).unwrap(),
        )
        .unwrap();
        assert_relative_eq!(similarity, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_unsorted_abscissae() {
        let x = [0.0, 2.0, 1.0];
        let y = [1.0, 2.0, 3.0];
        assert_eq!(CurveRef::new(&x, &y).unwrap_err(), MetricError::Unsorted);
    }

    #[test]
    fn absolute_difference_reports_largest_gap() {
        let x = [0.0, 1.0, 2.0];
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 2.5, 2.0];
        let gap = max_abs_difference(CurveRef::new(&x, &a).unwrap(), CurveRef::new(&x, &b).unwrap())
            .unwrap();
        assert_relative_eq!(gap, 1.0);
    }
}
