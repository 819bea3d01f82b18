// src/diagnostics.rs

use log::debug;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::EmpcaError;
use crate::lstsq::solve_coefficients;
use crate::model::EmpcaModel;
use crate::orthonormal::orthonormality_error;
use crate::scale::{scale_of, ScaleMode};
use crate::weighted_matrix::WeightedMatrix;

/// Noise floor of a weighted matrix: the R2 no model can exceed, because the
/// remaining variance is measurement noise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseFloor {
    /// `1 - noise_variance / total_variance`; `None` when either is undefined.
    pub r2_noise: Option<f64>,
    /// Mean of `1 / w` over non-zero weights; `None` without any.
    pub noise_variance: Option<f64>,
    /// Total variance the ratio was taken against.
    pub total_variance: f64,
}

/// Summary of a fitted model, for reports and logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub nvec: usize,
    pub iterations: usize,
    pub converged: bool,
    pub final_r2: Option<f64>,
    pub variance_curve: Vec<f64>,
    pub orthonormality_error: Option<f64>,    // max |V V^T - I|
    pub r2_noise: Option<f64>,
    pub components_above_noise: Option<usize>,
    pub insufficient_data_warnings: usize,
    pub notes: String,
}

/// R2 for 0..=nvec eigenvectors, as stored on the model at fit time.
pub fn explained_variance_curve(model: &EmpcaModel) -> Array1<f64> {
    model.variance_curve().clone()
}

/// Recomputes the variance curve of `model` on another matrix over the same
/// dimensions (for example held-out spectra), with the model's scale mode.
/// The matrix is centred on the model's means, not its own.
pub fn evaluate_variance_curve(matrix: &WeightedMatrix, model: &EmpcaModel) -> Result<Array1<f64>, EmpcaError> {
    let centered = model.center(matrix)?;
    let mode = model.scale_mode();
    let rcond = model.config().rcond;
    let total = scale_of(centered.values(), centered.weights(), mode);
    let (coefficients, _) = solve_coefficients(&centered, model.eigenvectors(), rcond)?;
    variance_curve(&centered, model.eigenvectors(), coefficients.view(), mode, total, rcond)
}

/// `1 - mean(1 / w) / total_variance` over the non-zero weights.
///
/// With inverse-variance weights `mean(1 / w)` is the average measurement
/// variance. A zero or non-finite `total_variance`, or a weight matrix without
/// any non-zero entry, gives an undefined (`None`) floor.
pub fn noise_floor(weights: ArrayView2<f64>, total_variance: f64) -> NoiseFloor {
    let mut inverse_sum = 0.0;
    let mut count = 0usize;
    for &w in weights.iter() {
        if w > 0.0 {
            inverse_sum += 1.0 / w;
            count += 1;
        }
    }
    let noise_variance = if count > 0 { Some(inverse_sum / count as f64) } else { None };
    let r2_noise = match noise_variance {
        Some(noise) if total_variance > 0.0 && total_variance.is_finite() => Some(1.0 - noise / total_variance),
        _ => None,
    };
    NoiseFloor { r2_noise, noise_variance, total_variance }
}

/// Noise floor of `matrix`'s weights against the model's total variance
/// under `mode`. `mode` need not match the mode the model was fitted with.
pub fn model_noise_floor(model: &EmpcaModel, matrix: &WeightedMatrix, mode: ScaleMode) -> NoiseFloor {
    noise_floor(matrix.weights(), model.total_variance(mode))
}

/// Smallest eigenvector count whose R2 reaches the noise floor. `None` if
/// the floor is undefined or never reached.
pub fn components_above_noise(curve: &Array1<f64>, floor: &NoiseFloor) -> Option<usize> {
    let r2_noise = floor.r2_noise?;
    curve.iter().position(|&r2| r2 >= r2_noise)
}

/// Collects the model's headline numbers, with the noise floor taken
/// against the model's own scale mode.
pub fn summarize_fit(model: &EmpcaModel, matrix: &WeightedMatrix) -> FitDiagnostics {
    let floor = model_noise_floor(model, matrix, model.scale_mode());
    let curve = explained_variance_curve(model);
    let insufficient = model.warnings().iter().filter(|w| w.is_insufficient_data()).count();
    FitDiagnostics {
        nvec: model.nvec(),
        iterations: model.iterations(),
        converged: model.converged(),
        final_r2: Some(model.r2()),
        variance_curve: curve.to_vec(),
        orthonormality_error: if model.nvec() > 0 { Some(orthonormality_error(model.eigenvectors())) } else { None },
        r2_noise: floor.r2_noise,
        components_above_noise: components_above_noise(&curve, &floor),
        insufficient_data_warnings: insufficient,
        notes: format!("{} warnings recorded", model.warnings().len()),
    }
}

/// `1 - scale(X - C V) / total` over the weighted entries of `matrix`;
/// 0 when `total` is not positive.
pub(crate) fn explained_fraction(
    matrix: &WeightedMatrix,
    coefficients: ArrayView2<f64>,
    basis: ArrayView2<f64>,
    mode: ScaleMode,
    total: f64,
) -> f64 {
    if !(total > 0.0) {
        return 0.0;
    }
    let residual = if basis.nrows() == 0 {
        matrix.values().to_owned()
    } else {
        &matrix.values() - &coefficients.dot(&basis)
    };
    1.0 - scale_of(residual.view(), matrix.weights(), mode) / total
}

/// R2 for every prefix `0..=k` of `basis`.
///
/// Prefix `j < k` refits the coefficients on the first `j` eigenvectors;
/// prefix `k` uses `coefficients` as given. The running maximum keeps the
/// curve non-decreasing even where the scale statistic is not nested.
pub(crate) fn variance_curve(
    matrix: &WeightedMatrix,
    basis: ArrayView2<f64>,
    coefficients: ArrayView2<f64>,
    mode: ScaleMode,
    total: f64,
    rcond: f64,
) -> Result<Array1<f64>, EmpcaError> {
    let k = basis.nrows();
    let mut curve = Array1::<f64>::zeros(k + 1);
    let mut best = 0.0;
    for j in 1..=k {
        let prefix = basis.slice(ndarray::s![0..j, ..]);
        let r2 = if j == k {
            explained_fraction(matrix, coefficients, prefix, mode, total)
        } else {
            let (refit, _) = solve_coefficients(matrix, prefix, rcond)?;
            explained_fraction(matrix, refit.view(), prefix, mode, total)
        };
        if r2 > best {
            best = r2;
        }
        curve[j] = best;
    }
    debug!("EMPCA variance curve: {:?}", curve.to_vec());
    Ok(curve)
}
