//! Box-constrained search space
//!
//! Every dimension maps to and from the unit interval, so the surrogate only
//! ever sees points of the unit hypercube.

use std::collections::BTreeMap;

use ndarray::Array1;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MolPropError, Result};

/// Value domain of one dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DimensionType {
    /// Continuous range, optionally searched in log space
    Real { low: f64, high: f64, log_scale: bool },
    /// Inclusive integer range
    Integer { low: i64, high: i64 },
}

/// A single named search dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub param_type: DimensionType,
}

impl Dimension {
    pub fn real(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            param_type: DimensionType::Real {
                low,
                high,
                log_scale: false,
            },
        }
    }

    pub fn log_real(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            param_type: DimensionType::Real {
                low,
                high,
                log_scale: true,
            },
        }
    }

    pub fn integer(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self {
            name: name.into(),
            param_type: DimensionType::Integer { low, high },
        }
    }

    fn validate(&self) -> Result<()> {
        let ok = match self.param_type {
            DimensionType::Real { low, high, log_scale } => {
                low.is_finite() && high.is_finite() && low < high && (!log_scale || low > 0.0)
            }
            DimensionType::Integer { low, high } => low <= high,
        };
        if ok {
            Ok(())
        } else {
            Err(MolPropError::ConfigError(format!(
                "invalid bounds for search dimension '{}': {:?}",
                self.name, self.param_type
            )))
        }
    }

    /// Map a unit-interval coordinate into the dimension
    pub fn from_unit(&self, u: f64) -> ParameterValue {
        let u = u.clamp(0.0, 1.0);
        match self.param_type {
            DimensionType::Real { low, high, log_scale: false } => {
                ParameterValue::Float((low + u * (high - low)).clamp(low, high))
            }
            DimensionType::Real { low, high, log_scale: true } => {
                let value = (low.ln() + u * (high.ln() - low.ln())).exp();
                ParameterValue::Float(value.clamp(low, high))
            }
            DimensionType::Integer { low, high } => {
                let width = (high - low + 1) as f64;
                let offset = (u * width).floor() as i64;
                ParameterValue::Int((low + offset).min(high))
            }
        }
    }

    /// Map a value back into the unit interval
    pub fn to_unit(&self, value: &ParameterValue) -> Result<f64> {
        let u = match (&self.param_type, value) {
            (DimensionType::Real { low, high, log_scale: false }, ParameterValue::Float(v)) => {
                (v - low) / (high - low)
            }
            (DimensionType::Real { low, high, log_scale: true }, ParameterValue::Float(v)) => {
                if *v <= 0.0 {
                    return Err(MolPropError::ConfigError(format!(
                        "'{}' is log-scaled but got {}",
                        self.name, v
                    )));
                }
                (v.ln() - low.ln()) / (high.ln() - low.ln())
            }
            (DimensionType::Integer { low, high }, ParameterValue::Int(v)) => {
                (*v - low) as f64 / (high - low + 1) as f64 + 0.5 / (high - low + 1) as f64
            }
            _ => {
                return Err(MolPropError::ConfigError(format!(
                    "value {:?} does not match dimension '{}'",
                    value, self.name
                )))
            }
        };
        Ok(u.clamp(0.0, 1.0))
    }
}

/// A parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_float(&self) -> f64 {
        match self {
            ParameterValue::Float(v) => *v,
            ParameterValue::Int(v) => *v as f64,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            ParameterValue::Float(_) => None,
        }
    }
}

/// Parameter name to value, ordered by name
pub type TrialParams = BTreeMap<String, ParameterValue>;

/// Ordered collection of dimensions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    dimensions: Vec<Dimension>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn real(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(Dimension::real(name, low, high))
    }

    pub fn log_real(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(Dimension::log_real(name, low, high))
    }

    pub fn integer(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(Dimension::integer(name, low, high))
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Bounds are ordered, log bounds are positive and names are unique
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(MolPropError::ConfigError("search space has no dimensions".to_string()));
        }
        for (i, dim) in self.dimensions.iter().enumerate() {
            dim.validate()?;
            if self.dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(MolPropError::ConfigError(format!(
                    "duplicate search dimension '{}'",
                    dim.name
                )));
            }
        }
        Ok(())
    }

    pub fn from_unit(&self, point: &[f64]) -> TrialParams {
        self.dimensions
            .iter()
            .zip(point)
            .map(|(dim, &u)| (dim.name.clone(), dim.from_unit(u)))
            .collect()
    }

    pub fn to_unit(&self, params: &TrialParams) -> Result<Array1<f64>> {
        self.dimensions
            .iter()
            .map(|dim| {
                let value = params.get(&dim.name).ok_or_else(|| {
                    MolPropError::ConfigError(format!("missing value for '{}'", dim.name))
                })?;
                dim.to_unit(value)
            })
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from)
    }

    /// Uniform point of the unit hypercube
    pub fn sample_unit(&self, rng: &mut impl Rng) -> Vec<f64> {
        (0..self.dimensions.len()).map(|_| rng.gen::<f64>()).collect()
    }

    /// Latin hypercube design of `n` unit points: one point per stratum in every dimension
    pub fn latin_hypercube(&self, n: usize, rng: &mut impl Rng) -> Vec<Vec<f64>> {
        let d = self.dimensions.len();
        let mut points = vec![vec![0.0; d]; n];
        for j in 0..d {
            let mut strata: Vec<usize> = (0..n).collect();
            for i in (1..n).rev() {
                let k = rng.gen_range(0..=i);
                strata.swap(i, k);
            }
            for (point, stratum) in points.iter_mut().zip(strata) {
                point[j] = (stratum as f64 + rng.gen::<f64>()) / n as f64;
            }
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .log_real("r_learn", 3e-4, 3e-2)
            .integer("batch_size", 13, 50)
            .real("dropout_pct", 0.0, 0.5)
    }

    #[test]
    fn test_unit_mapping_respects_bounds() {
        let space = space();
        let low = space.from_unit(&[0.0, 0.0, 0.0]);
        let high = space.from_unit(&[1.0, 1.0, 1.0]);
        assert!((low["r_learn"].as_float() - 3e-4).abs() < 1e-12);
        assert!((high["r_learn"].as_float() - 3e-2).abs() < 1e-12);
        assert_eq!(low["batch_size"], ParameterValue::Int(13));
        assert_eq!(high["batch_size"], ParameterValue::Int(50));
        assert_eq!(high["dropout_pct"], ParameterValue::Float(0.5));
    }

    #[test]
    fn test_log_midpoint_is_geometric_mean() {
        let space = space();
        let mid = space.from_unit(&[0.5, 0.5, 0.5]);
        assert!((mid["r_learn"].as_float() - 3e-3).abs() < 1e-9);
    }

    #[test]
    fn test_round_trip_through_unit() {
        let space = space();
        let params = space.from_unit(&[0.3, 0.7, 0.2]);
        let unit = space.to_unit(&params).unwrap();
        let again = space.from_unit(unit.as_slice().unwrap());
        assert_eq!(params["batch_size"], again["batch_size"]);
        for name in ["r_learn", "dropout_pct"] {
            assert!((params[name].as_float() - again[name].as_float()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_latin_hypercube_strata() {
        let space = space();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let points = space.latin_hypercube(10, &mut rng);
        for j in 0..3 {
            let mut strata: Vec<usize> = points.iter().map(|p| (p[j] * 10.0) as usize).collect();
            strata.sort_unstable();
            assert_eq!(strata, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_validation() {
        assert!(space().validate().is_ok());
        assert!(SearchSpace::new().validate().is_err());
        assert!(SearchSpace::new().log_real("x", 0.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().real("x", 1.0, 0.0).validate().is_err());
        assert!(SearchSpace::new().real("x", 0.0, 1.0).real("x", 0.0, 1.0).validate().is_err());
    }

    #[test]
    fn test_params_serialize_plainly() {
        let params = space().from_unit(&[0.0, 0.0, 0.0]);
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"batch_size\":13"));
        let back: TrialParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
