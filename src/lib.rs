// Weighted expectation-maximization PCA (EMPCA)

#![doc = include_str!("../README.md")]

pub mod cache;
pub mod diagnostics;
pub mod empca;
pub mod error;
pub mod linalg_backends;
mod lstsq;
pub mod model;
pub mod orthonormal;
pub mod scale;
pub mod selection;
pub mod weighted_matrix;
pub mod windows;

pub use cache::{CacheKey, CacheStatus, CachedFit, FileStore, MemoryStore, ModelCache, ModelStore};
pub use diagnostics::{
    components_above_noise, evaluate_variance_curve, explained_variance_curve, model_noise_floor, noise_floor,
    summarize_fit, FitDiagnostics, NoiseFloor,
};
pub use empca::{fit, EmpcaConfig, EmpcaSolver};
pub use error::{EmpcaError, FitUnit, FitWarning, ThreadSafeStdError};
pub use model::{EmpcaModel, Projection};
pub use scale::{column_scales, scale, ScaleMode, ScaleSummary};
pub use selection::{Comparison, FieldFilter, SampleFilter, StellarTable};
pub use weighted_matrix::{ResidualProvider, WeightedMatrix};
pub use windows::ElementWindows;
