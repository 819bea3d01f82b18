// src/windows.rs

use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::EmpcaError;
use crate::weighted_matrix::WeightedMatrix;

/// Process-wide element windows, loaded at most once.
static REGISTRY: OnceCell<ElementWindows> = OnceCell::new();

/// Per-element window functions over a common pixel grid.
///
/// A window is a non-negative weight per pixel; pixels with weight 0 do not
/// belong to the element. Windows are used to collapse per-pixel vectors
/// (eigenvectors, residuals) to one scalar per element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementWindows {
    n_pixels: usize,
    elements: Vec<String>,
    windows: Vec<Array1<f64>>,
}

impl ElementWindows {
    /// # Errors
    /// `InvalidConfiguration` for an empty or duplicated element name, a
    /// window of the wrong length, a negative or non-finite window weight,
    /// or a window that is zero everywhere.
    pub fn new(n_pixels: usize, windows: Vec<(String, Array1<f64>)>) -> Result<Self, EmpcaError> {
        let mut elements = Vec::with_capacity(windows.len());
        let mut arrays = Vec::with_capacity(windows.len());
        for (element, window) in windows {
            if element.is_empty() {
                return Err(EmpcaError::InvalidConfiguration("element name is empty".to_string()));
            }
            if elements.contains(&element) {
                return Err(EmpcaError::InvalidConfiguration(format!(
                    "element `{}` has more than one window",
                    element
                )));
            }
            if window.len() != n_pixels {
                return Err(EmpcaError::InvalidConfiguration(format!(
                    "window for `{}` has {} pixels, expected {}",
                    element,
                    window.len(),
                    n_pixels
                )));
            }
            if window.iter().any(|&w| !w.is_finite() || w < 0.0) {
                return Err(EmpcaError::InvalidConfiguration(format!(
                    "window for `{}` has negative or non-finite weights",
                    element
                )));
            }
            if window.sum() <= 0.0 {
                return Err(EmpcaError::InvalidConfiguration(format!(
                    "window for `{}` is zero everywhere",
                    element
                )));
            }
            elements.push(element);
            arrays.push(window);
        }
        Ok(Self { n_pixels, elements, windows: arrays })
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    pub fn window(&self, element: &str) -> Option<ArrayView1<'_, f64>> {
        self.index_of(element).ok().map(|idx| self.windows[idx].view())
    }

    /// Pixels where the window of `element` is non-zero.
    pub fn window_pixels(&self, element: &str) -> Option<Vec<usize>> {
        self.window(element).map(|w| {
            w.iter()
                .enumerate()
                .filter_map(|(p, &weight)| if weight > 0.0 { Some(p) } else { None })
                .collect()
        })
    }

    /// Sum of all element windows.
    pub fn combined(&self) -> Array1<f64> {
        let mut total = Array1::<f64>::zeros(self.n_pixels);
        for window in &self.windows {
            total += window;
        }
        total
    }

    /// Largest eigenvector count that leaves an element-space fit
    /// over-determined.
    pub fn max_element_nvec(&self) -> usize {
        self.n_elements().saturating_sub(1).max(1)
    }

    fn index_of(&self, element: &str) -> Result<usize, EmpcaError> {
        self.elements
            .iter()
            .position(|e| e == element)
            .ok_or_else(|| EmpcaError::InvalidConfiguration(format!("unknown element `{}`", element)))
    }

    /// Window-weighted mean of a per-pixel vector.
    ///
    /// Non-finite pixels (dimensions dropped before fitting) are skipped and
    /// the window renormalized over the rest. `None` when no window pixel is
    /// finite.
    pub fn weight_vector(&self, vector: ArrayView1<f64>, element: &str) -> Result<Option<f64>, EmpcaError> {
        self.check_width(vector.len())?;
        let window = &self.windows[self.index_of(element)?];
        Ok(window_mean(window.view(), vector))
    }

    /// Collapses each eigenvector row (k × P) to one value per element
    /// (k × n_elements). Undefined entries are `NaN`.
    pub fn weight_eigenvectors(&self, eigenvectors: ArrayView2<f64>) -> Result<Array2<f64>, EmpcaError> {
        self.check_width(eigenvectors.ncols())?;
        let mut out = Array2::from_elem((eigenvectors.nrows(), self.n_elements()), f64::NAN);
        for (k, vector) in eigenvectors.rows().into_iter().enumerate() {
            for (e, window) in self.windows.iter().enumerate() {
                if let Some(mean) = window_mean(window.view(), vector) {
                    out[[k, e]] = mean;
                }
            }
        }
        Ok(out)
    }

    /// Element-space version of a pixel-space matrix.
    ///
    /// Value: window-weighted mean over the observed pixels of the row.
    /// Weight: inverse of the propagated variance `sum_p a_p^2 / w_p`, where
    /// `a` is the window renormalized over those pixels. Elements with no
    /// observed pixel get weight 0.
    pub fn element_space(&self, matrix: &WeightedMatrix) -> Result<WeightedMatrix, EmpcaError> {
        self.check_width(matrix.ncols())?;
        let n_rows = matrix.nrows();
        let mut values = Array2::<f64>::zeros((n_rows, self.n_elements()));
        let mut weights = Array2::<f64>::zeros((n_rows, self.n_elements()));
        let pixel_values = matrix.values();
        let pixel_weights = matrix.weights();
        for i in 0..n_rows {
            let x = pixel_values.row(i);
            let w = pixel_weights.row(i);
            for (e, window) in self.windows.iter().enumerate() {
                let mut window_total = 0.0;
                let mut weighted_sum = 0.0;
                for p in 0..self.n_pixels {
                    if window[p] > 0.0 && w[p] > 0.0 {
                        window_total += window[p];
                        weighted_sum += window[p] * x[p];
                    }
                }
                if window_total <= 0.0 {
                    continue;
                }
                let mut variance = 0.0;
                for p in 0..self.n_pixels {
                    if window[p] > 0.0 && w[p] > 0.0 {
                        let a = window[p] / window_total;
                        variance += a * a / w[p];
                    }
                }
                if variance > 0.0 && variance.is_finite() {
                    values[[i, e]] = weighted_sum / window_total;
                    weights[[i, e]] = 1.0 / variance;
                }
            }
        }
        WeightedMatrix::new(values, weights)
    }

    fn check_width(&self, width: usize) -> Result<(), EmpcaError> {
        if width != self.n_pixels {
            return Err(EmpcaError::Dimension(format!(
                "expected {} pixels, got {}",
                self.n_pixels, width
            )));
        }
        Ok(())
    }
}

fn window_mean(window: ArrayView1<f64>, vector: ArrayView1<f64>) -> Option<f64> {
    let mut window_total = 0.0;
    let mut weighted_sum = 0.0;
    for (&a, &v) in window.iter().zip(vector.iter()) {
        if a > 0.0 && v.is_finite() {
            window_total += a;
            weighted_sum += a * v;
        }
    }
    if window_total > 0.0 {
        Some(weighted_sum / window_total)
    } else {
        None
    }
}

/// Installs the process-wide windows.
///
/// # Errors
/// `InvalidConfiguration` if windows were already installed.
pub fn install(windows: ElementWindows) -> Result<&'static ElementWindows, EmpcaError> {
    let n_elements = windows.n_elements();
    REGISTRY
        .set(windows)
        .map_err(|_| EmpcaError::InvalidConfiguration("element windows are already installed".to_string()))?;
    info!("Installed element windows for {} elements", n_elements);
    registry().ok_or_else(|| EmpcaError::InvalidConfiguration("element window registry is empty".to_string()))
}

/// The installed windows, if any.
pub fn registry() -> Option<&'static ElementWindows> {
    REGISTRY.get()
}

/// The installed windows, running `load` first if none are installed yet.
/// `load` runs at most once per process even under contention.
pub fn get_or_load<F>(load: F) -> Result<&'static ElementWindows, EmpcaError>
where
    F: FnOnce() -> Result<ElementWindows, EmpcaError>,
{
    REGISTRY.get_or_try_init(load)
}
