// src/scale.rs

use ndarray::{Array1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::weighted_matrix::WeightedMatrix;

/// Converts a median absolute deviation into a consistent estimate of the
/// standard deviation for Gaussian noise.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Which dispersion statistic normalizes variance ratios.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScaleMode {
    /// Weighted variance about the weighted mean.
    #[default]
    Classical,
    /// Squared, Gaussian-consistent weighted median absolute deviation.
    Robust,
}

impl ScaleMode {
    pub fn from_robust_flag(use_robust_scale: bool) -> Self {
        if use_robust_scale {
            ScaleMode::Robust
        } else {
            ScaleMode::Classical
        }
    }

    pub fn is_robust(self) -> bool {
        self == ScaleMode::Robust
    }
}

/// Both total scale statistics of a weighted matrix.
///
/// Kept together so that ratios can mix modes (e.g. a robust total against a
/// classical noise estimate) without re-reading the data.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleSummary {
    /// Weighted variance.
    pub classical: f64,
    /// `(1.4826 * weighted MAD)^2`.
    pub robust: f64,
    /// Entries with non-zero weight the statistics were computed over.
    pub weighted_entries: usize,
}

impl ScaleSummary {
    pub fn of(matrix: &WeightedMatrix) -> Self {
        let pairs = weighted_pairs(matrix.values(), matrix.weights());
        Self {
            classical: weighted_variance(&pairs).unwrap_or(0.0),
            robust: robust_variance(pairs.clone()).unwrap_or(0.0),
            weighted_entries: pairs.len(),
        }
    }

    pub fn get(&self, mode: ScaleMode) -> f64 {
        match mode {
            ScaleMode::Classical => self.classical,
            ScaleMode::Robust => self.robust,
        }
    }
}

/// Global scale of a weighted matrix, in variance units for both modes.
///
/// Classical mode returns the weighted variance; robust mode returns
/// `(1.4826 * MAD)^2` so the two are directly comparable. Fewer than two
/// weighted entries give `0.0`.
pub fn scale(matrix: &WeightedMatrix, robust: bool) -> f64 {
    scale_of(
        matrix.values(),
        matrix.weights(),
        ScaleMode::from_robust_flag(robust),
    )
}

/// Per-dimension variant of [`scale`]; one entry per column.
pub fn column_scales(matrix: &WeightedMatrix, robust: bool) -> Array1<f64> {
    let mode = ScaleMode::from_robust_flag(robust);
    let values = matrix.values();
    let weights = matrix.weights();
    let per_column: Vec<f64> = (0..matrix.ncols())
        .into_par_iter()
        .map(|j| {
            let pairs: Vec<(f64, f64)> = values
                .column(j)
                .iter()
                .zip(weights.column(j).iter())
                .filter(|&(_, &w)| w > 0.0)
                .map(|(&x, &w)| (x, w))
                .collect();
            scale_of_pairs(pairs, mode)
        })
        .collect();
    Array1::from(per_column)
}

/// Scale statistic of `values` restricted to entries with `weights > 0`.
pub(crate) fn scale_of(values: ArrayView2<f64>, weights: ArrayView2<f64>, mode: ScaleMode) -> f64 {
    scale_of_pairs(weighted_pairs(values, weights), mode)
}

fn scale_of_pairs(pairs: Vec<(f64, f64)>, mode: ScaleMode) -> f64 {
    let estimate = match mode {
        ScaleMode::Classical => weighted_variance(&pairs),
        ScaleMode::Robust => robust_variance(pairs),
    };
    estimate.unwrap_or(0.0)
}

fn weighted_pairs(values: ArrayView2<f64>, weights: ArrayView2<f64>) -> Vec<(f64, f64)> {
    let mut pairs = Vec::with_capacity(values.len());
    // Row-major walk keeps the accumulation order fixed.
    for (value_row, weight_row) in values.axis_iter(Axis(0)).zip(weights.axis_iter(Axis(0))) {
        Zip::from(&value_row).and(&weight_row).for_each(|&x, &w| {
            if w > 0.0 {
                pairs.push((x, w));
            }
        });
    }
    pairs
}

/// Weighted second moment about the weighted mean. `None` below two entries.
pub fn weighted_variance(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let total_weight: f64 = pairs.iter().map(|&(_, w)| w).sum();
    if total_weight <= 0.0 {
        return None;
    }
    let mean = pairs.iter().map(|&(x, w)| w * x).sum::<f64>() / total_weight;
    let second_moment = pairs
        .iter()
        .map(|&(x, w)| w * (x - mean) * (x - mean))
        .sum::<f64>()
        / total_weight;
    Some(second_moment)
}

/// Weighted median, treating weights as frequencies.
///
/// When the cumulative weight lands exactly on one half, the two straddling
/// values are averaged, which reproduces the ordinary median for uniform
/// weights.
pub fn weighted_median(mut pairs: Vec<(f64, f64)>) -> Option<f64> {
    pairs.retain(|&(_, w)| w > 0.0);
    if pairs.is_empty() {
        return None;
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total_weight: f64 = pairs.iter().map(|&(_, w)| w).sum();
    let half = 0.5 * total_weight;
    let tie_tolerance = 1e-12 * total_weight;
    let mut cumulative = 0.0;
    for (idx, &(x, w)) in pairs.iter().enumerate() {
        cumulative += w;
        if cumulative >= half - tie_tolerance {
            if (cumulative - half).abs() <= tie_tolerance && idx + 1 < pairs.len() {
                return Some(0.5 * (x + pairs[idx + 1].0));
            }
            return Some(x);
        }
    }
    pairs.last().map(|&(x, _)| x)
}

/// Weighted median absolute deviation about the weighted median.
/// `None` below two entries.
pub fn weighted_mad(pairs: Vec<(f64, f64)>) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let median = weighted_median(pairs.clone())?;
    let deviations = pairs
        .into_iter()
        .map(|(x, w)| ((x - median).abs(), w))
        .collect();
    weighted_median(deviations)
}

fn robust_variance(pairs: Vec<(f64, f64)>) -> Option<f64> {
    weighted_mad(pairs).map(|mad| {
        let sigma = MAD_TO_SIGMA * mad;
        sigma * sigma
    })
}
