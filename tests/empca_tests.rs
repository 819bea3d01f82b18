// In tests/empca_tests.rs

use approx::assert_abs_diff_eq;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use spectral_empca::orthonormal::{orthonormality_error, random_orthonormal_rows};
use spectral_empca::{
    components_above_noise, evaluate_variance_curve, explained_variance_curve, fit, model_noise_floor, noise_floor,
    scale, summarize_fit, EmpcaConfig, EmpcaError, EmpcaSolver, FitUnit, FitWarning, ScaleMode, WeightedMatrix,
};

/// X = U diag(singular_values) V with orthonormal U columns and V rows.
fn matrix_with_spectrum(n_rows: usize, singular_values: &[f64], seed: u64) -> Array2<f64> {
    let p = singular_values.len();
    let u = random_orthonormal_rows(p, n_rows, seed).reversed_axes();
    let v = random_orthonormal_rows(p, p, seed + 1);
    let s = Array2::from_diag(&Array1::from(singular_values.to_vec()));
    u.dot(&s).dot(&v)
}

fn random_mask(dim: (usize, usize), fraction: f64, seed: u64) -> Array2<bool> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::random_using(dim, Uniform::new(0.0, 1.0), &mut rng).mapv(|u: f64| u < fraction)
}

fn assert_parallel(a: ArrayView1<f64>, b: ArrayView1<f64>, tolerance: f64, context: &str) {
    let cosine = a.dot(&b).abs() / (a.dot(&a).sqrt() * b.dot(&b).sqrt());
    assert!(
        (1.0 - cosine).abs() < tolerance,
        "{}: vectors are not parallel (|cos| = {})",
        context,
        cosine
    );
}

fn assert_non_decreasing_from_zero(curve: &Array1<f64>) {
    assert_eq!(curve[0], 0.0, "curve must start at 0: {:?}", curve);
    for j in 1..curve.len() {
        assert!(curve[j] >= curve[j - 1], "curve decreases at {}: {:?}", j, curve);
    }
}

#[test]
fn uniform_weights_recover_covariance_eigenvectors() {
    let spectrum = [20.0, 10.0, 5.0, 2.5, 1.2, 0.6, 0.3, 0.15];
    let offset = Array1::from(vec![4.0, -3.0, 2.5, 10.0, -1.0, 0.5, 7.0, -6.0]);
    let x = matrix_with_spectrum(60, &spectrum, 3) + &offset;
    let matrix = WeightedMatrix::uniform(x.clone()).unwrap();
    let config = EmpcaConfig::new(3, 0.0, false).with_max_iterations(300);
    let model = EmpcaSolver::new(config).fit(matrix).unwrap();
    assert_eq!(model.nvec(), 3);

    let column_means = x.mean_axis(Axis(0)).unwrap();
    for (a, b) in model.mean().iter().zip(column_means.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    let centered = &x - &column_means;
    let covariance = centered.t().dot(&centered) / (x.nrows() as f64 - 1.0);
    let (eigenvalues, eigenvectors) = covariance.eigh(UPLO::Upper).unwrap();
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));
    for k in 0..3 {
        assert_parallel(
            model.eigenvectors().row(k),
            eigenvectors.column(order[k]),
            1e-8,
            &format!("component {}", k),
        );
    }
    // R2 of the leading component is its share of the covariance trace.
    let share = eigenvalues[order[0]] / eigenvalues.sum();
    assert_abs_diff_eq!(model.variance_curve()[1], share, epsilon = 1e-6);
}

#[test]
fn offset_data_does_not_spend_a_component_on_the_mean() {
    let mut rng = ChaCha8Rng::seed_from_u64(13);
    let unit = Array2::random_using((200, 6), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let scales = Array1::from(vec![5.0, 3.0, 1.0, 0.5, 0.2, 0.1]);
    let signal = &unit * &scales;
    let offset = signal.mapv(|v| v + 4.0);
    let centered_fit = fit(WeightedMatrix::uniform(signal).unwrap(), 2, 0.0, false).unwrap();
    let offset_fit = fit(WeightedMatrix::uniform(offset).unwrap(), 2, 0.0, false).unwrap();
    for k in 0..2 {
        assert_parallel(
            offset_fit.eigenvectors().row(k),
            centered_fit.eigenvectors().row(k),
            1e-8,
            &format!("component {}", k),
        );
    }
    assert!(offset_fit.variance_curve()[1] > 0.6, "curve {:?}", offset_fit.variance_curve());
    assert_abs_diff_eq!(
        offset_fit.variance_curve()[2],
        centered_fit.variance_curve()[2],
        epsilon = 1e-8
    );
}

#[test]
fn variance_curve_is_non_decreasing_and_starts_at_zero() {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let values = Array2::random_using((80, 12), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let mask = random_mask((80, 12), 0.3, 18);
    let matrix = WeightedMatrix::from_mask(values, &mask).unwrap();
    for robust in [false, true] {
        let model = fit(matrix.clone(), 5, 0.0, robust).unwrap();
        let curve = explained_variance_curve(&model);
        assert_eq!(curve.len(), 6);
        assert_non_decreasing_from_zero(&curve);
        assert!(curve[5] <= 1.0);
    }
}

#[test]
fn identical_inputs_give_identical_models() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let values = Array2::random_using((50, 9), Normal::new(0.0, 2.0).unwrap(), &mut rng);
    let weights = Array2::random_using((50, 9), Uniform::new(0.5, 2.0), &mut rng);
    let matrix = WeightedMatrix::new(values, weights).unwrap();
    let config = EmpcaConfig::new(4, 1e-9, true).with_random_seed(99);
    let first = EmpcaSolver::new(config.clone()).fit(matrix.clone()).unwrap();
    let second = EmpcaSolver::new(config).fit(matrix).unwrap();
    assert_eq!(first, second);
}

#[test]
fn eigenvectors_are_orthonormal_up_to_p_minus_one_components() {
    let mut rng = ChaCha8Rng::seed_from_u64(23);
    let values = Array2::random_using((40, 6), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let mask = random_mask((40, 6), 0.05, 24);
    let matrix = WeightedMatrix::from_mask(values, &mask).unwrap();
    let model = fit(matrix, 5, 0.0, false).unwrap();
    assert_eq!(model.nvec(), 5);
    assert!(orthonormality_error(model.eigenvectors()) < 1e-8);
}

#[test]
fn robust_scale_ignores_a_single_outlier() {
    let mut rng = ChaCha8Rng::seed_from_u64(31);
    let clean = Array2::random_using((50, 5), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let mut dirty = clean.clone();
    dirty[[7, 3]] = 1e6;
    let clean = WeightedMatrix::uniform(clean).unwrap();
    let dirty = WeightedMatrix::uniform(dirty).unwrap();

    let robust_change = (scale(&dirty, true) - scale(&clean, true)).abs() / scale(&clean, true);
    let classical_change = (scale(&dirty, false) - scale(&clean, false)).abs() / scale(&clean, false);
    assert!(robust_change < 0.05, "robust scale moved by {}", robust_change);
    assert!(classical_change > 100.0, "classical scale moved by only {}", classical_change);
}

#[test]
fn rank_two_signal_is_explained_down_to_the_noise_floor() {
    let (n_rows, n_dims, sigma) = (100, 10, 0.3);
    let mut rng = ChaCha8Rng::seed_from_u64(41);
    let basis = random_orthonormal_rows(2, n_dims, 42);
    let mut amplitudes = Array2::random_using((n_rows, 2), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    amplitudes.column_mut(0).mapv_inplace(|a| 5.0 * a);
    amplitudes.column_mut(1).mapv_inplace(|a| 3.0 * a);
    let noise = Array2::random_using((n_rows, n_dims), Normal::new(0.0, sigma).unwrap(), &mut rng);
    let values = amplitudes.dot(&basis) + &noise;
    let matrix = WeightedMatrix::new(values, Array2::from_elem((n_rows, n_dims), 1.0 / (sigma * sigma))).unwrap();

    let model = fit(matrix.clone(), 3, 0.0, false).unwrap();
    let curve = model.variance_curve();
    assert!(curve[2] >= 0.9, "R2 with two eigenvectors is {}", curve[2]);

    let floor = model_noise_floor(&model, &matrix, ScaleMode::Classical);
    assert_abs_diff_eq!(floor.noise_variance.unwrap(), sigma * sigma, epsilon = 1e-12);
    let total = model.total_variance(ScaleMode::Classical);
    // Two fitted directions absorb 2 of the 10 noise dimensions per row.
    let expected_residual = sigma * sigma * (n_dims as f64 - 2.0) / n_dims as f64;
    let residual = (1.0 - curve[2]) * total;
    assert!(
        (residual - expected_residual).abs() / expected_residual < 0.2,
        "residual variance {} vs expected {}",
        residual,
        expected_residual
    );
    let r2_noise = floor.r2_noise.unwrap();
    assert!(curve[2] >= r2_noise - 0.01);
    assert!(curve[1] < r2_noise);
    assert_eq!(components_above_noise(curve, &floor), Some(2));

    let summary = summarize_fit(&model, &matrix);
    assert_eq!(summary.components_above_noise, components_above_noise(curve, &floor));
    assert_eq!(summary.r2_noise, floor.r2_noise);
    assert_eq!(summary.variance_curve, curve.to_vec());
    assert!(summary.orthonormality_error.unwrap() < 1e-8);
}

#[test]
fn rank_two_signal_with_unit_weights_reaches_the_scenario_targets() {
    let (n_rows, n_dims, sigma) = (100, 10, 0.3);
    let mut rng = ChaCha8Rng::seed_from_u64(43);
    let basis = random_orthonormal_rows(2, n_dims, 44);
    let mut amplitudes = Array2::random_using((n_rows, 2), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    amplitudes.column_mut(0).mapv_inplace(|a| 5.0 * a);
    amplitudes.column_mut(1).mapv_inplace(|a| 3.0 * a);
    let noise = Array2::random_using((n_rows, n_dims), Normal::new(0.0, sigma).unwrap(), &mut rng);
    let matrix = WeightedMatrix::uniform(amplitudes.dot(&basis) + &noise).unwrap();

    let model = fit(matrix.clone(), 2, 0.0, false).unwrap();
    let curve = model.variance_curve();
    assert!(curve[2] >= 0.9, "R2 with two eigenvectors is {}", curve[2]);

    let floor = model_noise_floor(&model, &matrix, ScaleMode::Classical);
    assert_eq!(floor.noise_variance, Some(1.0));
    let r2_noise = floor.r2_noise.unwrap();
    assert!(r2_noise.is_finite());
    assert!(r2_noise >= 0.0 && r2_noise < 1.0, "noise floor {}", r2_noise);
}

#[test]
fn held_out_curve_starts_at_zero_and_checks_dimensions() {
    let mut rng = ChaCha8Rng::seed_from_u64(47);
    let basis = random_orthonormal_rows(3, 8, 48);
    let signal = |rng: &mut ChaCha8Rng| {
        let mut amplitudes = Array2::random_using((60, 3), Normal::new(0.0, 1.0).unwrap(), rng);
        amplitudes.column_mut(0).mapv_inplace(|a| 4.0 * a);
        amplitudes.column_mut(1).mapv_inplace(|a| 2.0 * a);
        amplitudes.dot(&basis)
            + Array2::random_using((60, 8), Normal::new(0.0, 0.1).unwrap(), rng)
            + 1.5
    };
    let training = WeightedMatrix::uniform(signal(&mut rng)).unwrap();
    let held_out = WeightedMatrix::from_mask(signal(&mut rng), &random_mask((60, 8), 0.1, 49)).unwrap();

    let model = fit(training, 3, 0.0, false).unwrap();
    let curve = evaluate_variance_curve(&held_out, &model).unwrap();
    assert_eq!(curve.len(), 4);
    assert_non_decreasing_from_zero(&curve);
    assert!(curve[3] > 0.9, "held-out curve {:?}", curve);

    let narrow = WeightedMatrix::uniform(Array2::zeros((5, 7))).unwrap();
    assert!(matches!(evaluate_variance_curve(&narrow, &model), Err(EmpcaError::Dimension(_))));
}

#[test]
fn row_warnings_only_name_rows_left_at_zero() {
    let mut rng = ChaCha8Rng::seed_from_u64(57);
    let values = Array2::random_using((40, 6), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let mask = random_mask((40, 6), 0.45, 58);
    let matrix = WeightedMatrix::from_mask(values, &mask).unwrap();
    for seed in 0..5 {
        let config = EmpcaConfig::new(3, 0.0, false).with_max_iterations(15).with_random_seed(seed);
        let model = EmpcaSolver::new(config).fit(matrix.clone()).unwrap();
        let flagged: Vec<usize> = model
            .warnings()
            .iter()
            .filter_map(|w| match w {
                FitWarning::InsufficientData { unit: FitUnit::Row(i), .. } => Some(*i),
                _ => None,
            })
            .collect();
        for (i, row) in model.coefficients().rows().into_iter().enumerate() {
            let zeroed = row.iter().all(|&c| c == 0.0);
            assert_eq!(flagged.contains(&i), zeroed, "row {} (seed {})", i, seed);
        }
    }
}

#[test]
fn zero_weight_row_has_zero_coefficients_and_no_influence() {
    let mut rng = ChaCha8Rng::seed_from_u64(53);
    let values = Array2::random_using((30, 5), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let weights = Array2::random_using((30, 5), Uniform::new(0.5, 1.5), &mut rng);

    let mut padded_values = values.clone();
    padded_values.push_row(Array1::from_elem(5, 123.0).view()).unwrap();
    let mut padded_weights = weights.clone();
    padded_weights.push_row(Array1::zeros(5).view()).unwrap();

    let config = EmpcaConfig::new(2, 0.0, false).with_max_iterations(40);
    let reference = EmpcaSolver::new(config.clone())
        .fit(WeightedMatrix::new(values, weights).unwrap())
        .unwrap();
    let padded = EmpcaSolver::new(config)
        .fit(WeightedMatrix::new(padded_values, padded_weights).unwrap())
        .unwrap();

    assert_eq!(padded.coefficients().row(30).to_vec(), vec![0.0, 0.0]);
    for (a, b) in padded.eigenvectors().iter().zip(reference.eigenvectors().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
    let kept_rows = padded.coefficients().slice(s![0..30, ..]).to_owned();
    for (a, b) in kept_rows.iter().zip(reference.coefficients().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
    assert!(padded.warnings().contains(&FitWarning::InsufficientData {
        unit: FitUnit::Row(30),
        observed: 0,
        required: 3,
    }));
}

#[test]
fn oversized_nvec_is_clamped_with_a_warning() {
    let mut rng = ChaCha8Rng::seed_from_u64(61);
    let values = Array2::random_using((20, 4), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let model = fit(WeightedMatrix::uniform(values).unwrap(), 10, 0.0, false).unwrap();
    assert_eq!(model.nvec(), 3);
    assert_eq!(model.requested_nvec(), 10);
    assert_eq!(model.variance_curve().len(), 4);
    assert!(model
        .warnings()
        .iter()
        .any(|w| matches!(w, FitWarning::ConfigurationError { parameter, .. } if parameter == "nvec")));
}

#[test]
fn masked_values_never_influence_the_fit() {
    let mut rng = ChaCha8Rng::seed_from_u64(71);
    let values = Array2::random_using((25, 6), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let mask = random_mask((25, 6), 0.25, 72);
    let mut poisoned = values.clone();
    for ((i, j), &masked) in mask.indexed_iter() {
        if masked {
            poisoned[[i, j]] = if (i + j) % 2 == 0 { f64::NAN } else { 1e30 };
        }
    }
    let clean = fit(WeightedMatrix::from_mask(values, &mask).unwrap(), 3, 0.0, false).unwrap();
    let dirty = fit(WeightedMatrix::from_mask(poisoned, &mask).unwrap(), 3, 0.0, false).unwrap();
    assert_eq!(clean, dirty);
    assert!(dirty.eigenvectors().iter().all(|v| v.is_finite()));
}

#[test]
fn constant_data_reports_a_degenerate_scale() {
    let matrix = WeightedMatrix::uniform(Array2::from_elem((10, 4), 2.5)).unwrap();
    let model = fit(matrix.clone(), 2, 0.0, false).unwrap();
    assert!(model.variance_curve().iter().all(|&r2| r2 == 0.0));
    assert!(model
        .warnings()
        .iter()
        .any(|w| matches!(w, FitWarning::DegenerateScale { mode: ScaleMode::Classical, .. })));
    let floor = noise_floor(matrix.weights(), model.total_variance(ScaleMode::Classical));
    assert_eq!(floor.r2_noise, None);
}

#[test]
fn convergence_delta_stops_early() {
    let x = matrix_with_spectrum(40, &[8.0, 4.0, 2.0, 1.0, 0.5], 81);
    let matrix = WeightedMatrix::uniform(x).unwrap();
    let config = EmpcaConfig::new(2, 1e-6, false).with_max_iterations(500);
    let model = EmpcaSolver::new(config).fit(matrix).unwrap();
    assert!(model.converged());
    assert!(model.iterations() < 500);
    assert!(model.convergence_delta().unwrap() < 1e-6);
}

#[test]
fn projection_reproduces_training_coefficients() {
    let x = matrix_with_spectrum(30, &[6.0, 3.0, 1.0, 0.5], 91);
    let matrix = WeightedMatrix::uniform(x).unwrap();
    let model = fit(matrix.clone(), 2, 0.0, false).unwrap();
    let projection = model.project(&matrix).unwrap();
    assert!(projection.warnings.is_empty());
    for (a, b) in projection.coefficients.iter().zip(model.coefficients().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    let wrong_width = WeightedMatrix::uniform(Array2::zeros((3, 5))).unwrap();
    assert!(model.project(&wrong_width).is_err());
}

#[test]
fn sparse_pixels_are_dropped_and_restored_as_nan() {
    let mut rng = ChaCha8Rng::seed_from_u64(101);
    let values = Array2::random_using((30, 8), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let mut mask = Array2::from_elem((30, 8), false);
    mask.column_mut(2).fill(true);
    mask.slice_mut(s![0..28, 5]).fill(true);
    let full = WeightedMatrix::from_mask(values, &mask).unwrap();

    let (reduced, kept) = full.select_columns_with_min_observations(5);
    assert_eq!(kept, vec![0, 1, 3, 4, 6, 7]);
    let model = fit(reduced, 2, 0.0, false).unwrap();
    let expanded = model.expanded_eigenvectors(&kept, 8).unwrap();
    assert_eq!(expanded.dim(), (2, 8));
    assert!(expanded.column(2).iter().all(|v| v.is_nan()));
    assert!(expanded.column(5).iter().all(|v| v.is_nan()));
    assert_eq!(expanded.column(7), model.eigenvectors().column(5));
    assert!(model.expanded_eigenvectors(&kept, 6).is_err());
}
