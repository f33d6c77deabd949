//! Search configuration

use serde::{Deserialize, Serialize};

use super::gaussian_process::Acquisition;
use crate::error::{MolPropError, Result};

/// How warm-up points are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPoints {
    /// Independent uniform points
    #[default]
    Random,
    /// Latin hypercube design
    LatinHypercube,
}

/// Configuration for Bayesian hyperparameter search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Total number of objective evaluations
    pub n_calls: usize,
    /// Warm-up evaluations before the surrogate is used
    pub n_initial_points: usize,
    pub initial_points: InitialPoints,
    pub acquisition: Acquisition,
    /// Random candidates scored per proposal
    pub n_candidates: usize,
    /// Candidates drawn around the incumbent per proposal
    pub n_local_candidates: usize,
    /// GP observation noise
    pub noise: f64,
    /// Length scales tried at every surrogate fit
    pub length_scales: Vec<f64>,
    /// Added to the worst finite score for a diverged trial
    pub failure_penalty: f64,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_calls: 10,
            n_initial_points: 10,
            initial_points: InitialPoints::Random,
            acquisition: Acquisition::default(),
            n_candidates: 1000,
            n_local_candidates: 100,
            noise: 1e-6,
            length_scales: vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0],
            failure_penalty: 1.0,
            seed: 100,
        }
    }
}

impl SearchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_calls(mut self, n: usize) -> Self {
        self.n_calls = n;
        self
    }

    pub fn with_initial_points(mut self, n: usize, kind: InitialPoints) -> Self {
        self.n_initial_points = n;
        self.initial_points = kind;
        self
    }

    pub fn with_acquisition(mut self, acquisition: Acquisition) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_n_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n;
        self
    }

    pub fn with_failure_penalty(mut self, penalty: f64) -> Self {
        self.failure_penalty = penalty;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_calls == 0 {
            return Err(MolPropError::ConfigError("n_calls must be at least 1".to_string()));
        }
        if self.n_candidates == 0 {
            return Err(MolPropError::ConfigError("n_candidates must be at least 1".to_string()));
        }
        if !(self.noise.is_finite() && self.noise > 0.0) {
            return Err(MolPropError::ConfigError(format!("noise must be positive, got {}", self.noise)));
        }
        if !(self.failure_penalty.is_finite() && self.failure_penalty >= 0.0) {
            return Err(MolPropError::ConfigError(format!(
                "failure_penalty must be a non-negative number, got {}",
                self.failure_penalty
            )));
        }
        Ok(())
    }
}
