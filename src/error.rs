// src/error.rs

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

use crate::scale::ScaleMode;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

/// Fatal errors. Only true contract violations (malformed inputs, failed I/O,
/// failed backend calls) end up here; data irregularities are reported as
/// [`FitWarning`]s on the returned model instead.
#[derive(Debug, thiserror::Error)]
pub enum EmpcaError {
    #[error("value matrix has shape {values:?} but weight matrix has shape {weights:?}")]
    ShapeMismatch {
        values: (usize, usize),
        weights: (usize, usize),
    },
    #[error("negative weight {weight} at ({row}, {col})")]
    NegativeWeight { row: usize, col: usize, weight: f64 },
    #[error("non-finite value or weight at ({row}, {col}) carries non-zero weight")]
    NonFinite { row: usize, col: usize },
    #[error("dimension error: {0}")]
    Dimension(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("linear algebra backend failed: {0}")]
    Backend(ThreadSafeStdError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::error::EncodeError> for EmpcaError {
    fn from(err: bincode::error::EncodeError) -> Self {
        EmpcaError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for EmpcaError {
    fn from(err: bincode::error::DecodeError) -> Self {
        EmpcaError::Serialization(err.to_string())
    }
}

/// The unit of work a weighted least-squares solve was attempted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FitUnit {
    /// Coefficient solve for one observation row.
    Row(usize),
    /// Eigenvector entry solve for one dimension of one component.
    Dimension { component: usize, dimension: usize },
}

impl fmt::Display for FitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitUnit::Row(row) => write!(f, "row {}", row),
            FitUnit::Dimension { component, dimension } => {
                write!(f, "component {} / dimension {}", component, dimension)
            }
        }
    }
}

/// Recoverable degradations recorded while fitting.
///
/// Each one means part of the result was zeroed, clamped or defined by
/// convention instead of computed, and the run carried on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FitWarning {
    /// A solve had fewer weighted observations than unknowns + 1, or its
    /// normal equations were numerically singular. The unit's contribution
    /// was set to zero.
    InsufficientData {
        unit: FitUnit,
        observed: usize,
        required: usize,
    },
    /// The total scale statistic of the data is zero, so every variance ratio
    /// derived from it is reported as 0.
    DegenerateScale { mode: ScaleMode, weighted_entries: usize },
    /// A configuration parameter was out of range and has been clamped.
    ConfigurationError { parameter: String, message: String },
}

impl FitWarning {
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, FitWarning::InsufficientData { .. })
    }
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::InsufficientData { unit, observed, required } => write!(
                f,
                "insufficient data for {}: {} weighted observations, {} required",
                unit, observed, required
            ),
            FitWarning::DegenerateScale { mode, weighted_entries } => write!(
                f,
                "{:?} scale of the data is zero ({} weighted entries)",
                mode, weighted_entries
            ),
            FitWarning::ConfigurationError { parameter, message } => {
                write!(f, "configuration parameter `{}`: {}", parameter, message)
            }
        }
    }
}
