// src/selection.rs

use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EmpcaError;

/// Test applied to one numeric field of a star.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Comparison {
    /// `|x - value| < 1e-12 * max(1, |value|)`.
    Equal { value: f64 },
    /// `lower < x < upper`.
    Between { lower: f64, upper: f64 },
    /// `x > bound`.
    Above { bound: f64 },
    /// `x < bound`.
    Below { bound: f64 },
}

/// Bounds closer than this select (almost) nothing and are rejected.
const MIN_BETWEEN_WIDTH: f64 = 1e-5;

impl Comparison {
    pub fn matches(&self, x: f64) -> bool {
        if !x.is_finite() {
            return false;
        }
        match *self {
            Comparison::Equal { value } => (x - value).abs() < 1e-12 * value.abs().max(1.0),
            Comparison::Between { lower, upper } => lower < x && x < upper,
            Comparison::Above { bound } => x > bound,
            Comparison::Below { bound } => x < bound,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match *self {
            Comparison::Equal { value } if !value.is_finite() => Err(format!("equality value {} is not finite", value)),
            Comparison::Between { lower, upper } => {
                if !lower.is_finite() || !upper.is_finite() {
                    Err(format!("bounds ({}, {}) are not finite", lower, upper))
                } else if upper - lower < MIN_BETWEEN_WIDTH {
                    Err(format!("lower bound {} is not below upper bound {}", lower, upper))
                } else {
                    Ok(())
                }
            }
            Comparison::Above { bound } | Comparison::Below { bound } if bound.is_nan() => {
                Err("bound is NaN".to_string())
            }
            _ => Ok(()),
        }
    }

    fn label(&self) -> String {
        match *self {
            Comparison::Equal { value } => format!("match{}", value),
            Comparison::Between { lower, upper } => format!("u{}_d{}", upper, lower),
            Comparison::Above { bound } => format!("d{}", bound),
            Comparison::Below { bound } => format!("u{}", bound),
        }
    }
}

/// One comparison on one named field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    #[serde(flatten)]
    pub comparison: Comparison,
}

/// Conjunction of field filters; an empty filter keeps every star.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleFilter {
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

/// Named numeric columns of per-star properties (temperature, surface
/// gravity, metallicity, cluster id, ...), all of the same length.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StellarTable {
    n_stars: usize,
    columns: BTreeMap<String, Array1<f64>>,
}

impl StellarTable {
    pub fn new(n_stars: usize) -> Self {
        Self { n_stars, columns: BTreeMap::new() }
    }

    pub fn with_column(mut self, name: &str, column: Array1<f64>) -> Result<Self, EmpcaError> {
        self.insert(name, column)?;
        Ok(self)
    }

    pub fn insert(&mut self, name: &str, column: Array1<f64>) -> Result<(), EmpcaError> {
        if column.len() != self.n_stars {
            return Err(EmpcaError::Dimension(format!(
                "column `{}` has {} entries for {} stars",
                name,
                column.len(),
                self.n_stars
            )));
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn n_stars(&self) -> usize {
        self.n_stars
    }

    pub fn column(&self, name: &str) -> Option<&Array1<f64>> {
        self.columns.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

impl SampleFilter {
    pub fn new(filters: Vec<FieldFilter>) -> Self {
        Self { filters }
    }

    pub fn with(mut self, field: &str, comparison: Comparison) -> Self {
        self.filters.push(FieldFilter { field: field.to_string(), comparison });
        self
    }

    /// Checks every filter names one of `fields` and has usable bounds.
    pub fn validate<'a, I>(&self, fields: I) -> Result<(), EmpcaError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let available: Vec<&str> = fields.into_iter().collect();
        for filter in &self.filters {
            if !available.contains(&filter.field.as_str()) {
                return Err(EmpcaError::InvalidConfiguration(format!(
                    "unknown field `{}` (available: {})",
                    filter.field,
                    available.join(", ")
                )));
            }
            filter.comparison.validate().map_err(|message| {
                EmpcaError::InvalidConfiguration(format!("filter on `{}`: {}", filter.field, message))
            })?;
        }
        Ok(())
    }

    /// Row mask: `true` for every star passing all filters. Non-finite
    /// field values never pass.
    pub fn select(&self, table: &StellarTable) -> Result<Vec<bool>, EmpcaError> {
        self.validate(table.fields())?;
        let mut keep = vec![true; table.n_stars()];
        for filter in &self.filters {
            let column = table.column(&filter.field).ok_or_else(|| {
                EmpcaError::InvalidConfiguration(format!("unknown field `{}`", filter.field))
            })?;
            for (flag, &x) in keep.iter_mut().zip(column.iter()) {
                *flag = *flag && filter.comparison.matches(x);
            }
        }
        debug!(
            "Sample filter `{}` kept {} of {} stars",
            self.label(),
            keep.iter().filter(|&&k| k).count(),
            table.n_stars()
        );
        Ok(keep)
    }

    /// Stable name for the subsample, for cache keys and output files.
    pub fn label(&self) -> String {
        if self.filters.is_empty() {
            return "all".to_string();
        }
        self.filters
            .iter()
            .map(|f| format!("{}_{}", f.field, f.comparison.label()))
            .collect::<Vec<_>>()
            .join("__")
    }
}
