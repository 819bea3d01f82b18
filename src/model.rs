// src/model.rs

use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::empca::EmpcaConfig;
use crate::error::{EmpcaError, FitWarning};
use crate::lstsq::solve_coefficients;
use crate::orthonormal::orthonormality_error;
use crate::scale::{ScaleMode, ScaleSummary};
use crate::weighted_matrix::WeightedMatrix;

/// Largest deviation from orthonormality a loaded basis may carry.
const LOADED_ORTHONORMALITY_TOLERANCE: f64 = 1e-6;

/// Result of one EMPCA fit. Immutable once returned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmpcaModel {
    /// Weighted mean of each dimension, subtracted before fitting.
    pub(crate) mean: Array1<f64>,
    /// k × P, one orthonormal eigenvector per row, in decreasing order of
    /// explained variance.
    pub(crate) eigenvectors: Array2<f64>,
    /// N × k weighted least-squares coefficients on `eigenvectors`.
    pub(crate) coefficients: Array2<f64>,
    /// R2 for 0..=k eigenvectors; entry 0 is 0, non-decreasing.
    pub(crate) variance_curve: Array1<f64>,
    pub(crate) scale_mode: ScaleMode,
    pub(crate) scales: ScaleSummary,
    pub(crate) r2: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
    /// |ΔR2| of the last iteration, `None` if no iteration ran.
    pub(crate) convergence_delta: Option<f64>,
    pub(crate) requested_nvec: usize,
    pub(crate) config: EmpcaConfig,
    pub(crate) warnings: Vec<FitWarning>,
}

/// Coefficients of new observations on a fitted basis.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    /// N × k.
    pub coefficients: Array2<f64>,
    pub warnings: Vec<FitWarning>,
}

impl EmpcaModel {
    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    pub fn eigenvectors(&self) -> ArrayView2<'_, f64> {
        self.eigenvectors.view()
    }

    pub fn coefficients(&self) -> ArrayView2<'_, f64> {
        self.coefficients.view()
    }

    pub fn variance_curve(&self) -> &Array1<f64> {
        &self.variance_curve
    }

    /// Number of fitted eigenvectors, after clamping.
    pub fn nvec(&self) -> usize {
        self.eigenvectors.nrows()
    }

    /// Number of eigenvectors that was asked for.
    pub fn requested_nvec(&self) -> usize {
        self.requested_nvec
    }

    pub fn n_dimensions(&self) -> usize {
        self.eigenvectors.ncols()
    }

    pub fn scale_mode(&self) -> ScaleMode {
        self.scale_mode
    }

    pub fn scales(&self) -> &ScaleSummary {
        &self.scales
    }

    /// Total scale of the centred fitted data under `mode`, whichever mode the fit
    /// itself used.
    pub fn total_variance(&self, mode: ScaleMode) -> f64 {
        self.scales.get(mode)
    }

    /// Total R2 with all `nvec` eigenvectors at the end of the final
    /// iteration.
    pub fn r2(&self) -> f64 {
        self.r2
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn convergence_delta(&self) -> Option<f64> {
        self.convergence_delta
    }

    pub fn config(&self) -> &EmpcaConfig {
        &self.config
    }

    pub fn warnings(&self) -> &[FitWarning] {
        &self.warnings
    }

    /// Eigenvectors placed back onto a grid of `full_width` dimensions.
    ///
    /// `kept[j]` is the full-grid index of fitted dimension `j`, as returned
    /// by [`WeightedMatrix::select_columns_with_min_observations`]. Dropped
    /// dimensions are `NaN`.
    pub fn expanded_eigenvectors(&self, kept: &[usize], full_width: usize) -> Result<Array2<f64>, EmpcaError> {
        if kept.len() != self.n_dimensions() {
            return Err(EmpcaError::Dimension(format!(
                "{} kept indices given for a basis over {} dimensions",
                kept.len(),
                self.n_dimensions()
            )));
        }
        if let Some(&bad) = kept.iter().find(|&&idx| idx >= full_width) {
            return Err(EmpcaError::Dimension(format!(
                "kept index {} out of range for a grid of {} dimensions",
                bad, full_width
            )));
        }
        let mut expanded = Array2::from_elem((self.nvec(), full_width), f64::NAN);
        for (j, &target) in kept.iter().enumerate() {
            expanded.column_mut(target).assign(&self.eigenvectors.column(j));
        }
        Ok(expanded)
    }

    /// Weighted least-squares coefficients of `matrix`, centred on the fitted
    /// means, on this basis.
    ///
    /// Rows with too few observed dimensions get zero coefficients and an
    /// `InsufficientData` warning, as during fitting.
    pub fn project(&self, matrix: &WeightedMatrix) -> Result<Projection, EmpcaError> {
        let centered = self.center(matrix)?;
        let (coefficients, warnings) = solve_coefficients(&centered, self.eigenvectors.view(), self.config.rcond)?;
        if !warnings.is_empty() {
            warn!("{} of {} projected rows were under-determined", warnings.len(), matrix.nrows());
        }
        Ok(Projection { coefficients, warnings })
    }

    /// `matrix` with the fitted means removed from its observed entries.
    pub(crate) fn center(&self, matrix: &WeightedMatrix) -> Result<WeightedMatrix, EmpcaError> {
        if matrix.ncols() != self.n_dimensions() {
            return Err(EmpcaError::Dimension(format!(
                "cannot project {} dimensions onto a basis over {} dimensions",
                matrix.ncols(),
                self.n_dimensions()
            )));
        }
        matrix.centered(self.mean.view())
    }

    /// Writes the model with bincode's standard configuration.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), EmpcaError> {
        bincode::serde::encode_into_std_write(self, writer, bincode::config::standard())?;
        Ok(())
    }

    /// Reads and validates a model written by [`EmpcaModel::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, EmpcaError> {
        let model: EmpcaModel = bincode::serde::decode_from_std_read(reader, bincode::config::standard())?;
        model.validate()?;
        Ok(model)
    }

    /// Saves the model to a file using bincode.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<(), EmpcaError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        info!("Saved EMPCA model with {} eigenvectors to {:?}", self.nvec(), path.as_ref());
        Ok(())
    }

    /// Loads a model previously saved with [`EmpcaModel::save_model`],
    /// rejecting one whose parts are inconsistent.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self, EmpcaError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    fn validate(&self) -> Result<(), EmpcaError> {
        let invalid = |message: String| Err(EmpcaError::Serialization(format!("loaded EMPCA model {}", message)));
        let k = self.eigenvectors.nrows();
        if self.coefficients.ncols() != k {
            return invalid(format!(
                "has {} coefficient columns for {} eigenvectors",
                self.coefficients.ncols(),
                k
            ));
        }
        if self.variance_curve.len() != k + 1 {
            return invalid(format!(
                "has a variance curve of length {} for {} eigenvectors",
                self.variance_curve.len(),
                k
            ));
        }
        if self.mean.len() != self.eigenvectors.ncols() {
            return invalid(format!(
                "has {} means for {} dimensions",
                self.mean.len(),
                self.eigenvectors.ncols()
            ));
        }
        if self
            .mean
            .iter()
            .chain(self.eigenvectors.iter())
            .chain(self.coefficients.iter())
            .any(|v| !v.is_finite())
        {
            return invalid("contains non-finite mean, eigenvector or coefficient entries".to_string());
        }
        if k > 0 && orthonormality_error(self.eigenvectors.view()) > LOADED_ORTHONORMALITY_TOLERANCE {
            return invalid("has eigenvectors that are not orthonormal".to_string());
        }
        let curve = &self.variance_curve;
        if curve.first().map_or(false, |&first| first != 0.0) {
            return invalid("has a variance curve that does not start at 0".to_string());
        }
        if curve.iter().zip(curve.iter().skip(1)).any(|(a, b)| !(b >= a)) {
            return invalid("has a decreasing variance curve".to_string());
        }
        Ok(())
    }
}
