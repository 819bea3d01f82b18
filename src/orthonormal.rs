// src/orthonormal.rs

use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Relative norm below which a vector is considered to lie in the span of
/// the vectors before it.
const DEGENERATE_RELATIVE_NORM: f64 = 1e-10;

/// `nvec` orthonormal rows of length `dim`, drawn from a seeded Gaussian.
///
/// The same `(nvec, dim, seed)` always yields the same basis.
pub fn random_orthonormal_rows(nvec: usize, dim: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut vectors = Array2::from_shape_fn((nvec, dim), |_| {
        let draw: f64 = StandardNormal.sample(&mut rng);
        draw
    });
    gram_schmidt(&mut vectors);
    vectors
}

/// Orthonormalizes the rows of `vectors` in place, in order.
///
/// Row `i` is made orthogonal to rows `0..i` (two passes of modified
/// Gram-Schmidt) and then normalized, so earlier rows keep their direction.
/// A row that collapses onto the span of earlier rows is replaced by the
/// standard basis direction least represented in that span, which keeps the
/// set orthonormal whenever `nrows <= ncols`.
///
/// Returns the number of rows that had to be replaced.
pub fn gram_schmidt(vectors: &mut Array2<f64>) -> usize {
    let (nvec, dim) = vectors.dim();
    let mut replaced = 0;
    for i in 0..nvec {
        let initial_norm = vectors.row(i).dot(&vectors.row(i)).sqrt();
        let mut candidate = vectors.row(i).to_owned();
        project_out(&mut candidate, vectors.view(), i);
        let norm = candidate.dot(&candidate).sqrt();
        let collapsed = !norm.is_finite()
            || !initial_norm.is_finite()
            || norm <= DEGENERATE_RELATIVE_NORM * initial_norm
            || norm == 0.0;
        if collapsed {
            candidate = complement_direction(vectors.view(), i, dim);
            replaced += 1;
        } else {
            candidate /= norm;
        }
        vectors.row_mut(i).assign(&candidate);
    }
    replaced
}

/// Removes from `candidate` its components along rows `0..upto`.
fn project_out(candidate: &mut Array1<f64>, basis: ArrayView2<f64>, upto: usize) {
    for _ in 0..2 {
        for j in 0..upto {
            let row = basis.row(j);
            let overlap = candidate.dot(&row);
            candidate.scaled_add(-overlap, &row);
        }
    }
}

fn complement_direction(basis: ArrayView2<f64>, upto: usize, dim: usize) -> Array1<f64> {
    let mut best = Array1::<f64>::zeros(dim);
    let mut best_norm = 0.0;
    for axis in 0..dim {
        let mut e = Array1::<f64>::zeros(dim);
        e[axis] = 1.0;
        project_out(&mut e, basis, upto);
        let norm = e.dot(&e).sqrt();
        if norm > best_norm {
            best_norm = norm;
            best = e;
        }
    }
    if best_norm > 0.0 {
        best /= best_norm;
    }
    best
}

/// Largest absolute deviation of `V V^T` from the identity, for row vectors.
pub fn orthonormality_error(vectors: ArrayView2<f64>) -> f64 {
    let gram = vectors.dot(&vectors.t());
    let mut worst: f64 = 0.0;
    for ((i, j), &g) in gram.indexed_iter() {
        let target = if i == j { 1.0 } else { 0.0 };
        worst = worst.max((g - target).abs());
    }
    worst
}
