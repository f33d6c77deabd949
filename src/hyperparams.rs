//! Hyperparameter configuration
//!
//! [`HpConfig`] is a validated name → value bundle. Every recognised name has a
//! declared domain; values outside it and unknown names are rejected. Once all
//! names are set, [`HpConfig::finalize`] produces an immutable
//! [`Hyperparameters`] value that a training run consumes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MolPropError, Result};
use crate::model::Activation;

/// Recognised hyperparameter names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HpName {
    RLearn,
    BatchSize,
    DropoutPct,
    Capacity,
    Activation,
}

impl HpName {
    pub const ALL: [HpName; 5] = [
        HpName::RLearn,
        HpName::BatchSize,
        HpName::DropoutPct,
        HpName::Capacity,
        HpName::Activation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HpName::RLearn => "r_learn",
            HpName::BatchSize => "batch_size",
            HpName::DropoutPct => "dropout_pct",
            HpName::Capacity => "capacity",
            HpName::Activation => "activation",
        }
    }

    /// Declared value domain
    pub fn domain(&self) -> HpDomain {
        match self {
            HpName::RLearn => HpDomain::Continuous {
                low: 0.0,
                high: 1.0,
                low_inclusive: false,
            },
            HpName::BatchSize => HpDomain::Integer { low: 1, high: 1_000_000 },
            HpName::DropoutPct => HpDomain::Continuous {
                low: 0.0,
                high: 1.0,
                low_inclusive: true,
            },
            HpName::Capacity => HpDomain::Integer { low: 0, high: 32 },
            HpName::Activation => HpDomain::Categorical,
        }
    }
}

impl fmt::Display for HpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HpName {
    type Err = MolPropError;

    fn from_str(s: &str) -> Result<Self> {
        HpName::ALL
            .iter()
            .copied()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| MolPropError::ConfigValidation {
                name: s.to_string(),
                value: "-".to_string(),
                reason: "unknown hyperparameter name".to_string(),
            })
    }
}

/// Declared domain of a hyperparameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HpDomain {
    /// Real interval, upper bound inclusive
    Continuous { low: f64, high: f64, low_inclusive: bool },
    /// Inclusive integer range
    Integer { low: i64, high: i64 },
    /// One of the [`Activation`] variants
    Categorical,
}

/// A hyperparameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HpValue {
    Float(f64),
    Int(i64),
    Activation(Activation),
}

impl fmt::Display for HpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpValue::Float(v) => write!(f, "{}", v),
            HpValue::Int(v) => write!(f, "{}", v),
            HpValue::Activation(a) => write!(f, "{}", a),
        }
    }
}

impl From<f64> for HpValue {
    fn from(v: f64) -> Self {
        HpValue::Float(v)
    }
}

impl From<i64> for HpValue {
    fn from(v: i64) -> Self {
        HpValue::Int(v)
    }
}

impl From<usize> for HpValue {
    fn from(v: usize) -> Self {
        HpValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<Activation> for HpValue {
    fn from(a: Activation) -> Self {
        HpValue::Activation(a)
    }
}

fn rejection(name: HpName, value: &HpValue, reason: impl Into<String>) -> MolPropError {
    MolPropError::ConfigValidation {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn check_domain(name: HpName, value: &HpValue) -> Result<()> {
    match (name.domain(), value) {
        (HpDomain::Continuous { low, high, low_inclusive }, HpValue::Float(v)) => {
            let above_low = if low_inclusive { *v >= low } else { *v > low };
            if v.is_finite() && above_low && *v <= high {
                Ok(())
            } else {
                let open = if low_inclusive { '[' } else { '(' };
                Err(rejection(name, value, format!("must lie in {}{}, {}]", open, low, high)))
            }
        }
        (HpDomain::Integer { low, high }, HpValue::Int(v)) => {
            if (low..=high).contains(v) {
                Ok(())
            } else {
                Err(rejection(name, value, format!("must lie in [{}, {}]", low, high)))
            }
        }
        (HpDomain::Categorical, HpValue::Activation(_)) => Ok(()),
        (HpDomain::Continuous { .. }, _) => Err(rejection(name, value, "expected a real value")),
        (HpDomain::Integer { .. }, _) => Err(rejection(name, value, "expected an integer value")),
        (HpDomain::Categorical, _) => Err(rejection(name, value, "expected an activation function")),
    }
}

/// Mutable hyperparameter bundle, validated on every assignment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HpConfig {
    values: BTreeMap<HpName, HpValue>,
}

impl HpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one value by name
    pub fn set(&mut self, name: &str, value: impl Into<HpValue>) -> Result<&mut Self> {
        let name: HpName = name.parse()?;
        let value = value.into();
        check_domain(name, &value)?;
        self.values.insert(name, value);
        Ok(self)
    }

    /// Set several values at once. Nothing is applied if any value is rejected.
    pub fn set_values<'a, I>(&mut self, values: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (&'a str, HpValue)>,
    {
        let mut staged = Vec::new();
        for (name, value) in values {
            let name: HpName = name.parse()?;
            check_domain(name, &value)?;
            staged.push((name, value));
        }
        self.values.extend(staged);
        Ok(self)
    }

    pub fn get(&self, name: HpName) -> Option<&HpValue> {
        self.values.get(&name)
    }

    /// Names that still need a value
    pub fn missing(&self) -> Vec<HpName> {
        HpName::ALL
            .iter()
            .copied()
            .filter(|n| !self.values.contains_key(n))
            .collect()
    }

    /// Freeze into an immutable [`Hyperparameters`]
    pub fn finalize(&self) -> Result<Hyperparameters> {
        if let Some(name) = self.missing().first() {
            return Err(MolPropError::ConfigValidation {
                name: name.to_string(),
                value: "<unset>".to_string(),
                reason: "every hyperparameter must be set before use".to_string(),
            });
        }

        let float = |n: HpName| match self.values.get(&n) {
            Some(HpValue::Float(v)) => *v,
            _ => f64::NAN,
        };
        let int = |n: HpName| match self.values.get(&n) {
            Some(HpValue::Int(v)) => *v as usize,
            _ => 0,
        };
        let activation = match self.values.get(&HpName::Activation) {
            Some(HpValue::Activation(a)) => *a,
            _ => Activation::default(),
        };

        Ok(Hyperparameters {
            r_learn: float(HpName::RLearn),
            batch_size: int(HpName::BatchSize),
            dropout_pct: float(HpName::DropoutPct),
            capacity: int(HpName::Capacity),
            activation,
        })
    }
}

impl fmt::Display for HpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Immutable hyperparameters for one training run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub r_learn: f64,
    pub batch_size: usize,
    pub dropout_pct: f64,
    pub capacity: usize,
    pub activation: Activation,
}

impl Hyperparameters {
    /// Re-check every field against its domain (used after deserialization)
    pub fn validate(&self) -> Result<()> {
        check_domain(HpName::RLearn, &HpValue::Float(self.r_learn))?;
        check_domain(HpName::BatchSize, &HpValue::from(self.batch_size))?;
        check_domain(HpName::DropoutPct, &HpValue::Float(self.dropout_pct))?;
        check_domain(HpName::Capacity, &HpValue::from(self.capacity))?;
        Ok(())
    }

    /// Back to a mutable bundle
    pub fn to_config(&self) -> HpConfig {
        let mut values = BTreeMap::new();
        values.insert(HpName::RLearn, HpValue::Float(self.r_learn));
        values.insert(HpName::BatchSize, HpValue::from(self.batch_size));
        values.insert(HpName::DropoutPct, HpValue::Float(self.dropout_pct));
        values.insert(HpName::Capacity, HpValue::from(self.capacity));
        values.insert(HpName::Activation, HpValue::Activation(self.activation));
        HpConfig { values }
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r_learn={:.3e}, batch_size={}, dropout_pct={:.3}, capacity={}, activation={}",
            self.r_learn, self.batch_size, self.dropout_pct, self.capacity, self.activation
        )
    }
}
