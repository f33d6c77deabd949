//! Model-ready matrices built from featurized records

use ndarray::{Array1, Array2, Axis};

use super::record::{FeatureLayout, PropertyGroup, Record};
use crate::error::{MolPropError, Result};
use crate::preprocessing::ScalerDict;

/// Feature matrix, scaled targets and per-row property selector
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedData {
    pub x: Array2<f64>,
    /// Targets in scaled units
    pub y: Array1<f64>,
    /// Position of each row's property within the group
    pub selectors: Vec<usize>,
}

impl PreparedData {
    pub fn new(x: Array2<f64>, y: Array1<f64>, selectors: Vec<usize>) -> Result<Self> {
        if x.nrows() != y.len() || y.len() != selectors.len() {
            return Err(MolPropError::ShapeError {
                expected: format!("{} rows everywhere", x.nrows()),
                actual: format!("y has {}, selectors has {}", y.len(), selectors.len()),
            });
        }
        Ok(Self { x, y, selectors })
    }

    /// Input rows only. Targets are scaled when `scalers` is given, otherwise zero.
    pub fn from_records(
        records: &[Record],
        layout: &FeatureLayout,
        group: &PropertyGroup,
        scalers: Option<&ScalerDict>,
    ) -> Result<Self> {
        let n_cols = layout.input_dim();
        let feature_dim = layout.feature_dim();
        let mut x = Array2::<f64>::zeros((records.len(), n_cols));
        let mut selectors = Vec::with_capacity(records.len());

        for (i, record) in records.iter().enumerate() {
            let features = record.features().ok_or_else(|| {
                MolPropError::DataError(format!("record '{}' has not been featurized", record.smiles))
            })?;
            if features.len() != feature_dim {
                return Err(MolPropError::ShapeError {
                    expected: format!("{} features", feature_dim),
                    actual: format!("{} features for '{}'", features.len(), record.smiles),
                });
            }
            let selector = group.selector_index(&record.prop).ok_or_else(|| {
                MolPropError::DataError(format!(
                    "property '{}' is not part of group '{}'",
                    record.prop, group.name
                ))
            })?;

            let mut row = x.row_mut(i);
            for (dst, src) in row.iter_mut().zip(features.iter()) {
                *dst = *src;
            }
            if layout.selector_dim > 0 {
                row[feature_dim + selector] = 1.0;
            }
            selectors.push(selector);
        }

        let y = match scalers {
            Some(scalers) => scalers.transform_records(records)?,
            None => Array1::zeros(records.len()),
        };

        Ok(Self { x, y, selectors })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            x: self.x.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
            selectors: indices.iter().map(|&i| self.selectors[i]).collect(),
        }
    }
}
