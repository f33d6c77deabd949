//! Per-property target scaling

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array1;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::Record;
use crate::error::{MolPropError, Result};

/// Type of scaler to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerType {
    /// Standard scaling (z-score normalization): (x - mean) / std
    #[default]
    Standard,
    /// Min-Max scaling: (x - min) / (max - min)
    MinMax,
    /// No scaling
    None,
}

/// Parameters for a fitted scaler
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    /// mean or min
    pub center: f64,
    /// std or range
    pub scale: f64,
}

impl ScalerParams {
    pub fn transform(&self, value: f64) -> f64 {
        (value - self.center) / self.scale
    }

    pub fn inverse_transform(&self, value: f64) -> f64 {
        value * self.scale + self.center
    }
}

/// One fitted transform per property, learned from training records only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerDict {
    scaler_type: ScalerType,
    params: BTreeMap<String, ScalerParams>,
}

impl ScalerDict {
    /// Fit one transform per property present in `records`
    pub fn fit(records: &[Record], scaler_type: ScalerType) -> Result<Self> {
        if records.is_empty() {
            return Err(MolPropError::InsufficientData(
                "cannot fit scalers on an empty record set".to_string(),
            ));
        }

        let mut by_prop: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for record in records {
            by_prop.entry(record.prop.as_str()).or_default().push(record.value);
        }

        let mut params = BTreeMap::new();
        for (prop, values) in by_prop {
            let ca = Float64Chunked::from_vec(prop.into(), values);
            let fitted = compute_params(&ca, scaler_type);
            debug!(prop, center = fitted.center, scale = fitted.scale, "fitted scaler");
            params.insert(prop.to_string(), fitted);
        }

        Ok(Self { scaler_type, params })
    }

    pub fn scaler_type(&self) -> ScalerType {
        self.scaler_type
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn get(&self, prop: &str) -> Option<&ScalerParams> {
        self.params.get(prop)
    }

    fn params_for(&self, prop: &str) -> Result<&ScalerParams> {
        self.params
            .get(prop)
            .ok_or_else(|| MolPropError::DataError(format!("no scaler fitted for property '{}'", prop)))
    }

    pub fn transform(&self, prop: &str, value: f64) -> Result<f64> {
        Ok(self.params_for(prop)?.transform(value))
    }

    pub fn inverse_transform(&self, prop: &str, value: f64) -> Result<f64> {
        Ok(self.params_for(prop)?.inverse_transform(value))
    }

    /// Multiplier taking a spread in scaled units back to original units
    pub fn scale_factor(&self, prop: &str) -> Result<f64> {
        Ok(self.params_for(prop)?.scale)
    }

    /// Scaled targets of `records` in input order
    pub fn transform_records(&self, records: &[Record]) -> Result<Array1<f64>> {
        records
            .iter()
            .map(|r| self.transform(&r.prop, r.value))
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from)
    }
}

impl fmt::Display for ScalerDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|(prop, p)| format!("{}: center={:.4}, scale={:.4}", prop, p.center, p.scale))
            .collect();
        write!(f, "{:?} [{}]", self.scaler_type, parts.join("; "))
    }
}

fn compute_params(ca: &Float64Chunked, scaler_type: ScalerType) -> ScalerParams {
    match scaler_type {
        ScalerType::Standard => {
            let mean = ca.mean().unwrap_or(0.0);
            let std = ca.std(1).filter(|s| s.is_finite()).unwrap_or(1.0);
            ScalerParams {
                center: mean,
                scale: if std == 0.0 { 1.0 } else { std },
            }
        }
        ScalerType::MinMax => {
            let min = ca.min().unwrap_or(0.0);
            let max = ca.max().unwrap_or(1.0);
            let range = max - min;
            ScalerParams {
                center: min,
                scale: if range == 0.0 { 1.0 } else { range },
            }
        }
        ScalerType::None => ScalerParams {
            center: 0.0,
            scale: 1.0,
        },
    }
}
