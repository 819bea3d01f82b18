// src/empca.rs

use log::{debug, info, trace, warn};
use ndarray::{Array2, ArrayView1, ArrayView2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

use crate::diagnostics::{explained_fraction, variance_curve};
use crate::error::{EmpcaError, FitUnit, FitWarning};
use crate::lstsq::solve_coefficients;
use crate::model::EmpcaModel;
use crate::orthonormal::{gram_schmidt, random_orthonormal_rows};
use crate::scale::{ScaleMode, ScaleSummary};
use crate::weighted_matrix::WeightedMatrix;

/// Minimum number of informative observations for one eigenvector entry.
const MIN_DIMENSION_OBSERVATIONS: usize = 2;

/// Parameters of one EMPCA run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmpcaConfig {
    /// Number of eigenvectors to fit. Clamped into `1..=max(P - 1, 1)` and to
    /// the number of rows carrying weight.
    pub nvec: usize,
    /// Stop once the total R2 changes by less than this between iterations.
    /// `0.0` disables early stopping; every run then uses `max_iterations`.
    pub convergence_delta: f64,
    /// Scale statistic used for every variance ratio of the run.
    pub scale_mode: ScaleMode,
    /// Upper bound on the number of alternating least-squares sweeps.
    pub max_iterations: usize,
    /// Seed for the random initial basis.
    pub random_seed: u64,
    /// Relative eigenvalue cutoff below which a coefficient system is treated
    /// as singular.
    pub rcond: f64,
}

impl Default for EmpcaConfig {
    fn default() -> Self {
        EmpcaConfig {
            nvec: 5,
            convergence_delta: 0.0,
            scale_mode: ScaleMode::Classical,
            max_iterations: 100,
            random_seed: 1,
            rcond: 1e-10,
        }
    }
}

impl EmpcaConfig {
    pub fn new(nvec: usize, convergence_delta: f64, use_robust_scale: bool) -> Self {
        EmpcaConfig {
            nvec,
            convergence_delta,
            scale_mode: ScaleMode::from_robust_flag(use_robust_scale),
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_random_seed(mut self, random_seed: u64) -> Self {
        self.random_seed = random_seed;
        self
    }

    pub fn with_rcond(mut self, rcond: f64) -> Self {
        self.rcond = rcond;
        self
    }

    pub fn with_scale_mode(mut self, scale_mode: ScaleMode) -> Self {
        self.scale_mode = scale_mode;
        self
    }
}

/// Parameters after clamping against the matrix they are applied to.
struct ResolvedParameters {
    nvec: usize,
    convergence_delta: f64,
    rcond: f64,
}

/// Weighted expectation-maximization PCA.
///
/// Alternates weighted least-squares solves for the coefficients (per row)
/// and for the eigenvectors (per dimension, one component at a time against
/// the data deflated by the components before it) until the total R2
/// settles.
#[derive(Clone, Debug, Default)]
pub struct EmpcaSolver {
    config: EmpcaConfig,
}

impl EmpcaSolver {
    pub fn new(config: EmpcaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmpcaConfig {
        &self.config
    }

    /// Fits `config.nvec` eigenvectors to `matrix`.
    ///
    /// Every dimension is centred on its weighted mean first; the means are
    /// kept on the model. The same matrix and configuration always produce the same model.
    ///
    /// # Errors
    /// `Dimension` for an empty matrix or one without any weighted entry,
    /// `Backend` if a linear algebra call fails. Every data irregularity is
    /// returned as a [`FitWarning`] on the model instead.
    pub fn fit(&self, matrix: WeightedMatrix) -> Result<EmpcaModel, EmpcaError> {
        let fit_start_time = Instant::now();
        let (n_rows, n_dims) = matrix.dim();
        if n_rows == 0 || n_dims == 0 {
            return Err(EmpcaError::Dimension(format!(
                "cannot fit EMPCA to an empty {}x{} matrix",
                n_rows, n_dims
            )));
        }
        let mut warnings: BTreeSet<FitWarning> = BTreeSet::new();
        let params = self.resolve_parameters(&matrix, &mut warnings)?;
        let mode = self.config.scale_mode;
        info!(
            "Starting EMPCA: {} rows x {} dimensions, {} weighted entries, nvec={}, delta={}, scale={:?}",
            n_rows,
            n_dims,
            matrix.weighted_entry_count(),
            params.nvec,
            params.convergence_delta,
            mode
        );

        let mean = matrix.column_means();
        let matrix = matrix.centered(mean.view())?;
        let scales = ScaleSummary::of(&matrix);
        let total_scale = scales.get(mode);
        if !(total_scale > 0.0) {
            let warning = FitWarning::DegenerateScale { mode, weighted_entries: scales.weighted_entries };
            warn!("{}; all R2 values are reported as 0", warning);
            warnings.insert(warning);
        }

        let mut eigenvectors = random_orthonormal_rows(params.nvec, n_dims, self.config.random_seed);
        // Only the latest row solve and the latest sweep describe the returned model.
        let (mut coefficients, mut row_warnings) =
            solve_coefficients(&matrix, eigenvectors.view(), params.rcond)?;
        let mut dimension_warnings: BTreeSet<FitWarning> = BTreeSet::new();
        let mut r2 = explained_fraction(&matrix, coefficients.view(), eigenvectors.view(), mode, total_scale);
        debug!("EMPCA initial basis: R2 = {:.6}", r2);

        let mut iterations = 0;
        let mut achieved_delta: Option<f64> = None;
        let mut converged = false;
        while iterations < self.config.max_iterations {
            let iteration_start_time = Instant::now();
            dimension_warnings.clear();
            let replaced =
                update_eigenvectors(&matrix, coefficients.view(), &mut eigenvectors, &mut dimension_warnings);
            if replaced > 0 {
                trace!("Replaced {} collapsed eigenvectors during orthonormalization", replaced);
            }
            let (next_coefficients, next_row_warnings) =
                solve_coefficients(&matrix, eigenvectors.view(), params.rcond)?;
            coefficients = next_coefficients;
            row_warnings = next_row_warnings;

            let next_r2 = explained_fraction(&matrix, coefficients.view(), eigenvectors.view(), mode, total_scale);
            let delta = (next_r2 - r2).abs();
            r2 = next_r2;
            iterations += 1;
            achieved_delta = Some(delta);
            debug!(
                "EMPCA iteration {}: R2 = {:.6}, |dR2| = {:.3e} ({:?})",
                iterations,
                r2,
                delta,
                iteration_start_time.elapsed()
            );
            if params.convergence_delta > 0.0 && delta < params.convergence_delta {
                converged = true;
                break;
            }
        }

        warnings.extend(row_warnings);
        warnings.extend(dimension_warnings);
        let curve = variance_curve(&matrix, eigenvectors.view(), coefficients.view(), mode, total_scale, params.rcond)?;
        summarize_warnings(&warnings);
        info!(
            "Finished EMPCA in {:?}: {} iterations, R2 = {:.6}{}",
            fit_start_time.elapsed(),
            iterations,
            r2,
            if converged { " (converged)" } else { "" }
        );

        Ok(EmpcaModel {
            mean,
            eigenvectors,
            coefficients,
            variance_curve: curve,
            scale_mode: mode,
            scales,
            r2,
            iterations,
            converged,
            convergence_delta: achieved_delta,
            requested_nvec: self.config.nvec,
            config: self.config.clone(),
            warnings: warnings.into_iter().collect(),
        })
    }

    fn resolve_parameters(
        &self,
        matrix: &WeightedMatrix,
        warnings: &mut BTreeSet<FitWarning>,
    ) -> Result<ResolvedParameters, EmpcaError> {
        let active_rows = matrix.active_row_count();
        if active_rows == 0 {
            return Err(EmpcaError::Dimension(
                "matrix has no entry with non-zero weight".to_string(),
            ));
        }
        let mut configuration_warning = |parameter: &str, message: String| {
            let warning = FitWarning::ConfigurationError { parameter: parameter.to_string(), message };
            warn!("{}", warning);
            warnings.insert(warning);
        };

        let max_nvec = matrix.ncols().saturating_sub(1).max(1);
        let mut nvec = self.config.nvec;
        if nvec == 0 {
            configuration_warning("nvec", "nvec must be at least 1; using 1".to_string());
            nvec = 1;
        }
        if nvec > max_nvec {
            configuration_warning(
                "nvec",
                format!("nvec {} exceeds the dimension count minus one; clamped to {}", nvec, max_nvec),
            );
            nvec = max_nvec;
        }
        if nvec > active_rows {
            configuration_warning(
                "nvec",
                format!("nvec {} exceeds the {} rows carrying weight; clamped to {}", nvec, active_rows, active_rows),
            );
            nvec = active_rows;
        }

        let mut convergence_delta = self.config.convergence_delta;
        if !(convergence_delta >= 0.0) {
            configuration_warning(
                "convergence_delta",
                format!("convergence_delta {} is not a non-negative number; early stopping disabled", convergence_delta),
            );
            convergence_delta = 0.0;
        }

        let mut rcond = self.config.rcond;
        if !(rcond >= 0.0) || !rcond.is_finite() {
            let fallback = EmpcaConfig::default().rcond;
            configuration_warning("rcond", format!("rcond {} is invalid; using {}", rcond, fallback));
            rcond = fallback;
        }

        Ok(ResolvedParameters { nvec, convergence_delta, rcond })
    }
}

/// Fits `nvec` eigenvectors with the default iteration cap and seed.
pub fn fit(
    matrix: WeightedMatrix,
    nvec: usize,
    convergence_delta: f64,
    use_robust_scale: bool,
) -> Result<EmpcaModel, EmpcaError> {
    EmpcaSolver::new(EmpcaConfig::new(nvec, convergence_delta, use_robust_scale)).fit(matrix)
}

enum DimensionSolve {
    Solved(f64),
    Degenerate { observed: usize },
}

/// `v = sum_i w_i c_i x_i / sum_i w_i c_i^2` over rows that are both observed
/// and carry a non-zero coefficient.
fn solve_dimension(residual: ArrayView1<f64>, weights: ArrayView1<f64>, coefficients: ArrayView1<f64>) -> DimensionSolve {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut informative = 0;
    Zip::from(residual).and(weights).and(coefficients).for_each(|&x, &w, &c| {
        if w > 0.0 && c != 0.0 {
            informative += 1;
            numerator += w * c * x;
            denominator += w * c * c;
        }
    });
    if informative < MIN_DIMENSION_OBSERVATIONS || !(denominator > 0.0) {
        return DimensionSolve::Degenerate { observed: informative };
    }
    let entry = numerator / denominator;
    if entry.is_finite() {
        DimensionSolve::Solved(entry)
    } else {
        DimensionSolve::Degenerate { observed: informative }
    }
}

/// One eigenvector sweep. Component `k` is fitted against the data with
/// components `0..k` (already updated in this sweep) removed, then the whole
/// set is re-orthonormalized. Returns the number of rows Gram-Schmidt had to
/// replace.
fn update_eigenvectors(
    matrix: &WeightedMatrix,
    coefficients: ArrayView2<f64>,
    eigenvectors: &mut Array2<f64>,
    warnings: &mut BTreeSet<FitWarning>,
) -> usize {
    let weights = matrix.weights();
    let mut residual = matrix.values().to_owned();
    let (nvec, n_dims) = eigenvectors.dim();
    for k in 0..nvec {
        let c = coefficients.column(k);
        let solved: Vec<DimensionSolve> = (0..n_dims)
            .into_par_iter()
            .map(|j| solve_dimension(residual.column(j), weights.column(j), c))
            .collect();
        for (j, outcome) in solved.into_iter().enumerate() {
            eigenvectors[[k, j]] = match outcome {
                DimensionSolve::Solved(entry) => entry,
                DimensionSolve::Degenerate { observed } => {
                    warnings.insert(FitWarning::InsufficientData {
                        unit: FitUnit::Dimension { component: k, dimension: j },
                        observed,
                        required: MIN_DIMENSION_OBSERVATIONS,
                    });
                    0.0
                }
            };
        }
        let component = eigenvectors.row(k);
        Zip::from(residual.rows_mut())
            .and(c)
            .par_for_each(|mut row, &ci| row.scaled_add(-ci, &component));
    }
    gram_schmidt(eigenvectors)
}

fn summarize_warnings(warnings: &BTreeSet<FitWarning>) {
    let mut rows = 0;
    let mut dimensions = 0;
    for warning in warnings {
        if let FitWarning::InsufficientData { unit, .. } = warning {
            trace!("{}", warning);
            match unit {
                FitUnit::Row(_) => rows += 1,
                FitUnit::Dimension { .. } => dimensions += 1,
            }
        }
    }
    if rows + dimensions > 0 {
        warn!(
            "EMPCA solves were under-determined and zeroed: {} rows, {} component dimensions",
            rows, dimensions
        );
    }
}
