//! Ensemble inference options

use serde::{Deserialize, Serialize};

use crate::error::{MolPropError, Result};
use crate::featurize::FeaturizationPolicy;

/// Units of returned targets, means and standard deviations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionScale {
    /// Units the submodels were trained in
    #[default]
    Scaled,
    /// Inverse transformed through the fitted scalers
    Original,
}

/// How [`eval_ensemble`](super::eval_ensemble) collects predictions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleOptions {
    /// Keep dropout active and sample every member `mc_passes` times
    pub monte_carlo: bool,
    pub mc_passes: usize,
    pub scale: PredictionScale,
    /// Seed for Monte Carlo sampling
    pub seed: u64,
    pub featurization: FeaturizationPolicy,
}

impl Default for EnsembleOptions {
    fn default() -> Self {
        Self {
            monte_carlo: false,
            mc_passes: 10,
            scale: PredictionScale::Scaled,
            seed: 100,
            featurization: FeaturizationPolicy::Drop,
        }
    }
}

impl EnsembleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monte_carlo(mut self, passes: usize) -> Self {
        self.monte_carlo = true;
        self.mc_passes = passes;
        self
    }

    pub fn with_scale(mut self, scale: PredictionScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_featurization(mut self, policy: FeaturizationPolicy) -> Self {
        self.featurization = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.monte_carlo && self.mc_passes == 0 {
            return Err(MolPropError::ConfigError(
                "mc_passes must be at least 1 in monte carlo mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Predictions collected from each member
    pub fn passes_per_member(&self) -> usize {
        if self.monte_carlo {
            self.mc_passes
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EnsembleOptions::default();
        assert!(!options.monte_carlo);
        assert_eq!(options.passes_per_member(), 1);
        assert_eq!(options.scale, PredictionScale::Scaled);
    }

    #[test]
    fn test_monte_carlo_needs_passes() {
        assert!(EnsembleOptions::new().with_monte_carlo(0).validate().is_err());
        assert_eq!(EnsembleOptions::new().with_monte_carlo(4).passes_per_member(), 4);
    }
}
