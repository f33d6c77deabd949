//! molprop - Uncertainty-aware ensembles for molecular property prediction
//!
//! This crate trains k-fold ensembles of small neural regressors on molecular
//! fingerprints, tunes their hyperparameters with Bayesian optimization and
//! reports predictions with an ensemble spread as the uncertainty estimate.
//!
//! # Modules
//!
//! ## Data
//! - [`data`] - Records, CSV loading, stratified splits and folds
//! - [`featurize`] - SMILES parsing and hashed circular fingerprints
//! - [`preprocessing`] - Per-property target scaling
//!
//! ## Modelling
//! - [`hyperparams`] - Validated hyperparameter bundles
//! - [`model`] - Regressor and model factory interfaces, MLP regressor
//! - [`optimizer`] - Gaussian-process Bayesian search
//! - [`training`] - Submodel training, k-fold ensembles, artifact storage
//! - [`inference`] - Ensemble loading and mean/std prediction
//! - [`metrics`] - Held-out error and uncertainty coverage
//!
//! ## Orchestration
//! - [`config`] - Pipeline configuration
//! - [`device`] - Compute device selection
//! - [`pipeline`] - End-to-end training run per property group
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;
pub mod config;
pub mod device;

// Data
pub mod data;
pub mod featurize;
pub mod preprocessing;

// Modelling
pub mod hyperparams;
pub mod model;
pub mod optimizer;
pub mod training;
pub mod inference;
pub mod metrics;

// Orchestration
pub mod pipeline;
pub mod cli;

pub use error::{MolPropError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{MolPropError, Result, Stage, StageContext};

    // Configuration
    pub use crate::config::PipelineConfig;
    pub use crate::device::{Device, DeviceChoice};

    // Data
    pub use crate::data::{load_records, make_folds, split, DatasetLoader, FeatureLayout, PropertyGroup, Record};
    pub use crate::featurize::{featurize_records, FeatureEncoder, FeaturizationPolicy, HashedFingerprint};
    pub use crate::preprocessing::{ScalerDict, ScalerType};

    // Modelling
    pub use crate::hyperparams::{HpConfig, HpValue, Hyperparameters};
    pub use crate::model::{Activation, MlpFactory, MlpOut, ModelFactory, Regressor};
    pub use crate::optimizer::{BayesianSearch, SearchConfig, SearchResult, SearchSpace};
    pub use crate::training::{
        train_kfold_ensemble, ArtifactStore, EnsembleTrainer, MinibatchTrainer, SubmodelTrainer, TrainConfig,
    };
    pub use crate::inference::{eval_ensemble, Ensemble, EnsembleOptions, EnsemblePrediction, PredictionScale};
    pub use crate::metrics::{MetricsReport, RegressionMetrics};

    // Orchestration
    pub use crate::pipeline::{GroupReport, Pipeline};
}
