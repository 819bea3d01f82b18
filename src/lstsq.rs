// src/lstsq.rs

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{EmpcaError, FitUnit, FitWarning, ThreadSafeStdError};
use crate::linalg_backends::{BackendEigh, LinAlgBackendProvider};
use crate::weighted_matrix::WeightedMatrix;

/// Solves the symmetric positive semi-definite system `A x = b` through an
/// eigendecomposition of `A`.
///
/// Returns `Ok(None)` when `A` is numerically singular, i.e. its smallest
/// eigenvalue is below `rcond` times its largest (or `A` is not positive).
fn solve_symmetric<B: BackendEigh<f64>>(
    backend: &B,
    a: &Array2<f64>,
    b: &Array1<f64>,
    rcond: f64,
) -> Result<Option<Array1<f64>>, ThreadSafeStdError> {
    let eigh = backend.eigh_upper(a)?;
    let largest = eigh.eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let smallest = eigh.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(largest > 0.0) || !largest.is_finite() || smallest <= rcond * largest {
        return Ok(None);
    }
    // x = V diag(1/lambda) V^T b
    let projected = eigh.eigenvectors.t().dot(b) / &eigh.eigenvalues;
    Ok(Some(eigh.eigenvectors.dot(&projected)))
}

/// Outcome of one weighted least-squares coefficient solve.
enum RowSolve {
    Solved(Array1<f64>),
    Degenerate { observed: usize },
}

/// Weighted least-squares coefficients of one row on the basis rows of
/// `basis` (k × P): minimizes `sum_j w_j (x_j - sum_l c_l basis[l, j])^2`.
fn solve_row<B: BackendEigh<f64>>(
    backend: &B,
    basis: ArrayView2<f64>,
    values: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    rcond: f64,
) -> Result<RowSolve, ThreadSafeStdError> {
    let k = basis.nrows();
    let observed = weights.iter().filter(|&&w| w > 0.0).count();
    if observed < k + 1 {
        return Ok(RowSolve::Degenerate { observed });
    }
    let weighted_basis = &basis * &weights.insert_axis(Axis(0));
    let normal_matrix = weighted_basis.dot(&basis.t());
    let rhs = weighted_basis.dot(&values);
    match solve_symmetric(backend, &normal_matrix, &rhs, rcond)? {
        Some(c) if c.iter().all(|v| v.is_finite()) => Ok(RowSolve::Solved(c)),
        _ => Ok(RowSolve::Degenerate { observed }),
    }
}

/// Coefficients of every row of `matrix` on `basis`, solved in parallel.
///
/// Rows that cannot be determined (fewer than `k + 1` weighted entries, or a
/// singular system) get a zero coefficient vector and an `InsufficientData`
/// warning.
pub(crate) fn solve_coefficients(
    matrix: &WeightedMatrix,
    basis: ArrayView2<f64>,
    rcond: f64,
) -> Result<(Array2<f64>, Vec<FitWarning>), EmpcaError> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let k = basis.nrows();
    let values = matrix.values();
    let weights = matrix.weights();
    let mut coefficients = Array2::<f64>::zeros((matrix.nrows(), k));
    if k == 0 {
        return Ok((coefficients, Vec::new()));
    }

    let outcomes: Vec<Result<RowSolve, ThreadSafeStdError>> = (0..matrix.nrows())
        .into_par_iter()
        .map(|i| solve_row(&backend, basis, values.row(i), weights.row(i), rcond))
        .collect();

    let mut warnings = Vec::new();
    for (i, outcome) in outcomes.into_iter().enumerate() {
        match outcome.map_err(EmpcaError::Backend)? {
            RowSolve::Solved(c) => coefficients.row_mut(i).assign(&c),
            RowSolve::Degenerate { observed } => warnings.push(FitWarning::InsufficientData {
                unit: FitUnit::Row(i),
                observed,
                required: k + 1,
            }),
        }
    }
    Ok((coefficients, warnings))
}
