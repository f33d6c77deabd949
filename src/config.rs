//! Pipeline configuration
//!
//! Defaults match the standard polymer property run. A JSON file may set any
//! subset of fields; CLI flags are applied on top of it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::PropertyGroup;
use crate::device::DeviceChoice;
use crate::error::{MolPropError, Result};
use crate::featurize::{FeaturizationPolicy, HashedFingerprint};
use crate::hyperparams::{HpConfig, HpValue, Hyperparameters};
use crate::inference::{EnsembleOptions, PredictionScale};
use crate::model::Activation;
use crate::optimizer::{InitialPoints, SearchConfig, SearchSpace, TrialParams};
use crate::preprocessing::ScalerType;

/// Box bounds of the searched hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchBounds {
    /// Learning rate range, searched on a log scale
    pub r_learn: (f64, f64),
    /// Dropout range
    pub dropout_pct: (f64, f64),
    /// Lower batch size bound as a fraction of `max_batch_size`
    pub min_batch_fraction: f64,
}

impl Default for SearchBounds {
    fn default() -> Self {
        Self {
            r_learn: (3e-4, 3e-2),
            dropout_pct: (0.0, 0.5),
            min_batch_fraction: 0.25,
        }
    }
}

/// Everything a training run needs besides the data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub random_seed: u64,
    /// Epochs per search trial
    pub hp_epochs: usize,
    /// Epochs per ensemble member
    pub submodel_epochs: usize,
    pub n_folds: usize,
    pub hp_ncalls: usize,
    pub hp_initial_points: usize,
    pub initial_points: InitialPoints,
    pub max_batch_size: usize,
    /// Hidden layer count used for search and ensemble alike
    pub capacity: usize,
    pub activation: Activation,
    pub n_features: usize,
    pub fingerprint_radius: usize,
    pub use_chirality: bool,
    pub test_fraction: f64,
    pub hp_val_fraction: f64,
    /// Group name to property names
    pub property_groups: BTreeMap<String, Vec<String>>,
    pub search: SearchBounds,
    pub scaler: ScalerType,
    pub monte_carlo: bool,
    pub mc_passes: usize,
    pub strict_featurization: bool,
    pub parallel_folds: bool,
    pub inverse_transform_metrics: bool,
    pub failure_penalty: f64,
    pub device: DeviceChoice,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut property_groups = BTreeMap::new();
        property_groups.insert(
            "electronic".to_string(),
            ["Egc", "Egb", "Ea", "Ei"].iter().map(|p| p.to_string()).collect(),
        );
        Self {
            random_seed: 100,
            hp_epochs: 20,
            submodel_epochs: 100,
            n_folds: 3,
            hp_ncalls: 10,
            hp_initial_points: 10,
            initial_points: InitialPoints::Random,
            max_batch_size: 50,
            capacity: 2,
            activation: Activation::LeakyReLU,
            n_features: 512,
            fingerprint_radius: 2,
            use_chirality: true,
            test_fraction: 0.2,
            hp_val_fraction: 0.2,
            property_groups,
            search: SearchBounds::default(),
            scaler: ScalerType::Standard,
            monte_carlo: false,
            mc_passes: 10,
            strict_featurization: false,
            parallel_folds: false,
            inverse_transform_metrics: false,
            failure_penalty: 1.0,
            device: DeviceChoice::Cpu,
        }
    }
}

fn fraction_in_unit_interval(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(MolPropError::ConfigError(format!("{} must be in (0, 1), got {}", name, value)))
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MolPropError::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| MolPropError::ConfigError(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    pub fn with_hp_calls(mut self, n_calls: usize) -> Self {
        self.hp_ncalls = n_calls;
        self
    }

    pub fn with_hp_initial_points(mut self, n: usize) -> Self {
        self.hp_initial_points = n;
        self
    }

    pub fn with_epochs(mut self, hp_epochs: usize, submodel_epochs: usize) -> Self {
        self.hp_epochs = hp_epochs;
        self.submodel_epochs = submodel_epochs;
        self
    }

    pub fn with_n_features(mut self, n_features: usize) -> Self {
        self.n_features = n_features;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Replace all property groups
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        self.property_groups = groups.into_iter().map(|(name, props)| (name.into(), props)).collect();
        self
    }

    pub fn with_monte_carlo(mut self, enabled: bool) -> Self {
        self.monte_carlo = enabled;
        self
    }

    pub fn with_strict_featurization(mut self, strict: bool) -> Self {
        self.strict_featurization = strict;
        self
    }

    pub fn with_parallel_folds(mut self, parallel: bool) -> Self {
        self.parallel_folds = parallel;
        self
    }

    pub fn with_device(mut self, device: DeviceChoice) -> Self {
        self.device = device;
        self
    }

    pub fn validate(&self) -> Result<()> {
        fraction_in_unit_interval("test_fraction", self.test_fraction)?;
        fraction_in_unit_interval("hp_val_fraction", self.hp_val_fraction)?;
        if self.n_folds < 2 {
            return Err(MolPropError::ConfigError(format!("n_folds must be at least 2, got {}", self.n_folds)));
        }
        if self.hp_ncalls == 0 {
            return Err(MolPropError::ConfigError("hp_ncalls must be at least 1".to_string()));
        }
        if self.hp_epochs == 0 || self.submodel_epochs == 0 {
            return Err(MolPropError::ConfigError("epoch counts must be at least 1".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(MolPropError::ConfigError("max_batch_size must be at least 1".to_string()));
        }
        if self.n_features == 0 {
            return Err(MolPropError::ConfigError("n_features must be at least 1".to_string()));
        }
        if self.monte_carlo && self.mc_passes == 0 {
            return Err(MolPropError::ConfigError("mc_passes must be at least 1".to_string()));
        }
        if self.property_groups.is_empty() {
            return Err(MolPropError::ConfigError("no property groups configured".to_string()));
        }
        if let Some((name, _)) = self.property_groups.iter().find(|(_, props)| props.is_empty()) {
            return Err(MolPropError::ConfigError(format!("property group '{}' is empty", name)));
        }

        let (lr_low, lr_high) = self.search.r_learn;
        if !(lr_low > 0.0 && lr_low < lr_high) {
            return Err(MolPropError::ConfigError(format!(
                "search.r_learn bounds must satisfy 0 < low < high, got ({}, {})",
                lr_low, lr_high
            )));
        }
        let (dr_low, dr_high) = self.search.dropout_pct;
        if !(dr_low >= 0.0 && dr_low < dr_high && dr_high <= 1.0) {
            return Err(MolPropError::ConfigError(format!(
                "search.dropout_pct bounds must satisfy 0 <= low < high <= 1, got ({}, {})",
                dr_low, dr_high
            )));
        }
        if !(self.search.min_batch_fraction > 0.0 && self.search.min_batch_fraction <= 1.0) {
            return Err(MolPropError::ConfigError(format!(
                "search.min_batch_fraction must be in (0, 1], got {}",
                self.search.min_batch_fraction
            )));
        }

        self.fixed_hyperparameters()?;
        Ok(())
    }

    /// Configured groups in name order
    pub fn groups(&self) -> Vec<PropertyGroup> {
        self.property_groups
            .iter()
            .map(|(name, props)| PropertyGroup::new(name.clone(), props.iter().cloned()))
            .collect()
    }

    /// Searched batch size range
    pub fn batch_size_bounds(&self) -> (i64, i64) {
        let high = self.max_batch_size as i64;
        let low = (self.search.min_batch_fraction * self.max_batch_size as f64).round() as i64;
        (low.clamp(1, high), high)
    }

    pub fn search_space(&self) -> SearchSpace {
        let (lr_low, lr_high) = self.search.r_learn;
        let (dr_low, dr_high) = self.search.dropout_pct;
        let (bs_low, bs_high) = self.batch_size_bounds();
        SearchSpace::new()
            .log_real("r_learn", lr_low, lr_high)
            .integer("batch_size", bs_low, bs_high)
            .real("dropout_pct", dr_low, dr_high)
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig::default()
            .with_n_calls(self.hp_ncalls)
            .with_initial_points(self.hp_initial_points, self.initial_points)
            .with_failure_penalty(self.failure_penalty)
            .with_seed(self.random_seed)
    }

    fn fixed_hyperparameters(&self) -> Result<HpConfig> {
        let mut hps = HpConfig::new();
        hps.set_values([
            ("capacity", HpValue::from(self.capacity)),
            ("activation", HpValue::Activation(self.activation)),
        ])?;
        Ok(hps)
    }

    /// Searched values from `params` plus the fixed capacity and activation
    pub fn hyperparameters(&self, params: &TrialParams) -> Result<Hyperparameters> {
        let value = |name: &str| {
            params
                .get(name)
                .ok_or_else(|| MolPropError::ConfigError(format!("trial has no value for '{}'", name)))
        };
        let batch_size = value("batch_size")?;
        let batch_size = batch_size
            .as_int()
            .unwrap_or_else(|| batch_size.as_float().round() as i64);

        let mut hps = self.fixed_hyperparameters()?;
        hps.set_values([
            ("r_learn", HpValue::Float(value("r_learn")?.as_float())),
            ("batch_size", HpValue::Int(batch_size)),
            ("dropout_pct", HpValue::Float(value("dropout_pct")?.as_float())),
        ])?;
        hps.finalize()
    }

    pub fn encoder(&self) -> HashedFingerprint {
        HashedFingerprint::new(self.n_features)
            .with_radius(self.fingerprint_radius)
            .with_chirality(self.use_chirality)
    }

    pub fn featurization_policy(&self) -> FeaturizationPolicy {
        if self.strict_featurization {
            FeaturizationPolicy::Strict
        } else {
            FeaturizationPolicy::Drop
        }
    }

    pub fn ensemble_options(&self) -> EnsembleOptions {
        let scale = if self.inverse_transform_metrics {
            PredictionScale::Original
        } else {
            PredictionScale::Scaled
        };
        let options = EnsembleOptions::new()
            .with_scale(scale)
            .with_seed(self.random_seed)
            .with_featurization(self.featurization_policy());
        if self.monte_carlo {
            options.with_monte_carlo(self.mc_passes)
        } else {
            options
        }
    }
}
