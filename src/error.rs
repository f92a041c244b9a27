use std::collections::BTreeSet;

use thiserror::Error;

/// Unified error type for `convflow` operations.
///
/// Every variant is a hard failure: it signals a setup mistake or a broken
/// criterion rather than a convergence outcome. Failed runs are never
/// reported through this type; they are captured in the record list.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// Raised when an input series holds fewer than two values.
    #[error("input series must contain at least 2 values, found {len}")]
    InvalidInputSeries { len: usize },

    /// Raised when an input series is built from a value that cannot be iterated in order.
    #[error("input series must be an ordered sequence, found {found}")]
    NotIterable {
        /// Short description of what was supplied instead.
        found: String,
    },

    /// Raised when two consecutive successful results expose different targets.
    #[error("keys of current and prior results are inconsistent: {current:?} != {prior:?}")]
    InconsistentResultKeys {
        current: BTreeSet<String>,
        prior: BTreeSet<String>,
    },

    /// Raised when a successful result does not expose exactly the targets of the criteria.
    #[error(
        "keys of current result inconsistent with keys of convergence criteria: {result:?} != {criteria:?}"
    )]
    CriteriaKeyMismatch {
        result: BTreeSet<String>,
        criteria: BTreeSet<String>,
    },

    /// Raised when a criterion descriptor names a comparison that does not exist.
    #[error("unknown convergence criterion `{kind}` for target `{target}`")]
    UnknownCriterion { target: String, kind: String },

    /// Raised when a criterion cannot be applied to the quantities it was handed.
    #[error("criterion `{kind}` cannot compare target `{target}`: {reason}")]
    IncompatibleQuantity {
        target: String,
        kind: &'static str,
        reason: String,
    },

    /// Raised when a similarity metric produces NaN.
    #[error("encountered NaN during {context}")]
    NumericalError { context: &'static str },

    /// Raised when an input file or working directory cannot be prepared.
    #[error("I/O failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Raised when a configuration document cannot be decoded.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl ConvergenceError {
    /// Helper to wrap an I/O error with a short description of the failing action.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Helper to raise when a metric is asked to compare unsuitable quantities.
    pub fn incompatible(target: &str, kind: &'static str, reason: impl Into<String>) -> Self {
        Self::IncompatibleQuantity {
            target: target.to_string(),
            kind,
            reason: reason.into(),
        }
    }

    /// Returns true for the configuration class of errors (bad series or key sets).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidInputSeries { .. }
                | Self::NotIterable { .. }
                | Self::InconsistentResultKeys { .. }
                | Self::CriteriaKeyMismatch { .. }
        )
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, ConvergenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_configuration_errors() {
        assert!(ConvergenceError::InvalidInputSeries { len: 1 }.is_configuration());
        let unknown = ConvergenceError::UnknownCriterion {
            target: "x".into(),
            kind: "magic".into(),
        };
        assert!(!unknown.is_configuration());
        assert_eq!(
            unknown.to_string(),
            "unknown convergence criterion `magic` for target `x`"
        );
    }
}
