// src/weighted_matrix.rs

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::error::EmpcaError;

/// Observations paired with per-entry inverse-variance weights.
///
/// Shape is (n_observations, n_dimensions) for both matrices. A weight of
/// `0.0` marks an entry as missing: it never influences a fit, a scale
/// statistic, or a diagnostic. Values at zero-weight entries are stored as
/// `0.0`, whatever was passed in (masked pixels are often `NaN`).
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedMatrix {
    values: Array2<f64>,
    weights: Array2<f64>,
}

impl WeightedMatrix {
    /// Builds a weighted matrix after validating the pairing.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `values` and `weights` differ in shape.
    /// - `NegativeWeight` for any weight below zero.
    /// - `NonFinite` for a non-finite weight, or a non-finite value at an
    ///   entry with non-zero weight.
    pub fn new(mut values: Array2<f64>, weights: Array2<f64>) -> Result<Self, EmpcaError> {
        if values.dim() != weights.dim() {
            return Err(EmpcaError::ShapeMismatch {
                values: values.dim(),
                weights: weights.dim(),
            });
        }
        for ((row, col), &w) in weights.indexed_iter() {
            if !w.is_finite() {
                return Err(EmpcaError::NonFinite { row, col });
            }
            if w < 0.0 {
                return Err(EmpcaError::NegativeWeight { row, col, weight: w });
            }
            if w > 0.0 && !values[[row, col]].is_finite() {
                return Err(EmpcaError::NonFinite { row, col });
            }
        }
        Zip::from(&mut values).and(&weights).for_each(|v, &w| {
            if w == 0.0 {
                *v = 0.0;
            }
        });
        Ok(Self { values, weights })
    }

    /// Every entry observed with weight 1.
    pub fn uniform(values: Array2<f64>) -> Result<Self, EmpcaError> {
        let weights = Array2::ones(values.dim());
        Self::new(values, weights)
    }

    /// Weight 1 where `mask` is `false`, 0 where it is `true`.
    ///
    /// This follows the masked-array convention: `true` means "masked out".
    pub fn from_mask(values: Array2<f64>, mask: &Array2<bool>) -> Result<Self, EmpcaError> {
        if values.dim() != mask.dim() {
            return Err(EmpcaError::ShapeMismatch {
                values: values.dim(),
                weights: mask.dim(),
            });
        }
        let weights = mask.mapv(|masked| if masked { 0.0 } else { 1.0 });
        Self::new(values, weights)
    }

    /// Inverse-variance weights `1 / sigma^2` at unmasked entries.
    ///
    /// Entries whose uncertainty is not finite and strictly positive are
    /// treated as masked.
    pub fn with_uncertainties(
        values: Array2<f64>,
        mask: &Array2<bool>,
        sigmas: &Array2<f64>,
    ) -> Result<Self, EmpcaError> {
        if values.dim() != mask.dim() || values.dim() != sigmas.dim() {
            return Err(EmpcaError::ShapeMismatch {
                values: values.dim(),
                weights: sigmas.dim(),
            });
        }
        let mut weights = Array2::<f64>::zeros(values.dim());
        Zip::from(&mut weights)
            .and(mask)
            .and(sigmas)
            .for_each(|w, &masked, &sigma| {
                if !masked && sigma.is_finite() && sigma > 0.0 {
                    *w = 1.0 / (sigma * sigma);
                }
            });
        Self::new(values, weights)
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn weights(&self) -> ArrayView2<'_, f64> {
        self.weights.view()
    }

    pub fn into_parts(self) -> (Array2<f64>, Array2<f64>) {
        (self.values, self.weights)
    }

    /// Number of entries with non-zero weight.
    pub fn weighted_entry_count(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    /// Non-zero weights per observation row.
    pub fn row_observation_counts(&self) -> Array1<usize> {
        self.weights
            .map_axis(Axis(1), |row| row.iter().filter(|&&w| w > 0.0).count())
    }

    /// Non-zero weights per dimension.
    pub fn column_observation_counts(&self) -> Array1<usize> {
        self.weights
            .map_axis(Axis(0), |col| col.iter().filter(|&&w| w > 0.0).count())
    }

    /// Rows that carry at least one non-zero weight.
    pub fn active_row_count(&self) -> usize {
        self.row_observation_counts().iter().filter(|&&c| c > 0).count()
    }

    /// Weighted mean of each dimension over its observed entries; 0 for a
    /// dimension without any.
    pub fn column_means(&self) -> Array1<f64> {
        Zip::from(self.values.columns())
            .and(self.weights.columns())
            .map_collect(|x, w| {
                let total = w.sum();
                if total > 0.0 {
                    x.dot(&w) / total
                } else {
                    0.0
                }
            })
    }

    /// Subtracts `means[j]` from every observed entry of dimension `j`.
    /// Unobserved entries stay `0.0`.
    pub fn centered(&self, means: ArrayView1<f64>) -> Result<Self, EmpcaError> {
        if means.len() != self.ncols() {
            return Err(EmpcaError::Dimension(format!(
                "{} means given for {} columns",
                means.len(),
                self.ncols()
            )));
        }
        let mut values = self.values.clone();
        Zip::indexed(&mut values).and(&self.weights).for_each(|(_, j), x, &w| {
            if w > 0.0 {
                *x -= means[j];
            }
        });
        Ok(Self { values, weights: self.weights.clone() })
    }

    /// Keeps the given dimensions, in the given order.
    pub fn select_columns(&self, columns: &[usize]) -> Result<Self, EmpcaError> {
        if let Some(&bad) = columns.iter().find(|&&c| c >= self.ncols()) {
            return Err(EmpcaError::Dimension(format!(
                "column index {} out of range for {} columns",
                bad,
                self.ncols()
            )));
        }
        Ok(Self {
            values: self.values.select(Axis(1), columns),
            weights: self.weights.select(Axis(1), columns),
        })
    }

    /// Keeps the rows where `keep` is `true`.
    pub fn select_rows(&self, keep: &[bool]) -> Result<Self, EmpcaError> {
        if keep.len() != self.nrows() {
            return Err(EmpcaError::Dimension(format!(
                "row selection has length {} but matrix has {} rows",
                keep.len(),
                self.nrows()
            )));
        }
        let rows: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| if k { Some(i) } else { None })
            .collect();
        Ok(Self {
            values: self.values.select(Axis(0), &rows),
            weights: self.weights.select(Axis(0), &rows),
        })
    }

    /// Drops dimensions observed in fewer than `min_observations` rows.
    ///
    /// Returns the reduced matrix together with the indices of the kept
    /// dimensions in the unreduced matrix, which
    /// [`EmpcaModel::expanded_eigenvectors`](crate::EmpcaModel::expanded_eigenvectors)
    /// uses to map eigenvectors back onto the full grid.
    pub fn select_columns_with_min_observations(
        &self,
        min_observations: usize,
    ) -> (Self, Vec<usize>) {
        let kept: Vec<usize> = self
            .column_observation_counts()
            .iter()
            .enumerate()
            .filter_map(|(j, &count)| if count >= min_observations { Some(j) } else { None })
            .collect();
        let reduced = Self {
            values: self.values.select(Axis(1), &kept),
            weights: self.weights.select(Axis(1), &kept),
        };
        (reduced, kept)
    }
}

/// Supplies the residual matrix for one logical unit of the pipeline
/// (a pixel group, an element group, a stellar subsample).
///
/// Implemented by the residual-fitting stage; this crate only consumes it.
pub trait ResidualProvider {
    /// Human-readable identity of the unit, used in logs.
    fn label(&self) -> String;

    fn residuals(&self) -> Result<WeightedMatrix, EmpcaError>;
}
