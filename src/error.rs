//! Error types for the molprop pipeline

use std::fmt;
use thiserror::Error;

/// Result type alias for molprop operations
pub type Result<T> = std::result::Result<T, MolPropError>;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Featurization,
    Prepare,
    Split,
    Search,
    /// k-fold ensemble training outside any single fold
    Ensemble,
    /// Zero-based fold index out of `total` folds
    Fold { index: usize, total: usize },
    Inference,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Load => write!(f, "data loading"),
            Stage::Featurization => write!(f, "featurization"),
            Stage::Prepare => write!(f, "data preparation"),
            Stage::Split => write!(f, "split"),
            Stage::Search => write!(f, "hyperparameter search"),
            Stage::Ensemble => write!(f, "ensemble training"),
            Stage::Fold { index, total } => write!(f, "fold {} of {}", index + 1, total),
            Stage::Inference => write!(f, "inference"),
            Stage::Persist => write!(f, "persistence"),
        }
    }
}

/// Main error type for molprop
#[derive(Error, Debug)]
pub enum MolPropError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("Featurization error for '{identifier}': {reason}")]
    FeaturizationError { identifier: String, reason: String },

    #[error("Training diverged at epoch {epoch}: loss = {loss}")]
    TrainingDiverged { epoch: usize, loss: f64 },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Persistence error at {path}: {reason}")]
    PersistenceError { path: String, reason: String },

    #[error("Invalid hyperparameter: {name} = {value}, {reason}")]
    ConfigValidation {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Optimization error: {0}")]
    OptimizationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Model not fitted")]
    ModelNotFitted,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<MolPropError>,
    },
}

impl MolPropError {
    /// Attach a pipeline stage. An error that already carries a stage keeps it.
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            staged @ MolPropError::Stage { .. } => staged,
            other => MolPropError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was attributed to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            MolPropError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error with any stage wrapping removed
    pub fn root_cause(&self) -> &MolPropError {
        match self {
            MolPropError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether a hyperparameter search may penalize this error instead of aborting
    pub fn is_recoverable_in_search(&self) -> bool {
        matches!(self.root_cause(), MolPropError::TrainingDiverged { .. })
    }

    pub(crate) fn persistence(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        MolPropError::PersistenceError {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Attach a [`Stage`] to the error of a `Result`
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.at_stage(stage))
    }
}

impl From<polars::error::PolarsError> for MolPropError {
    fn from(err: polars::error::PolarsError) -> Self {
        MolPropError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for MolPropError {
    fn from(err: serde_json::Error) -> Self {
        MolPropError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for MolPropError {
    fn from(err: ndarray::ShapeError) -> Self {
        MolPropError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MolPropError::DataError("test error".to_string());
        assert_eq!(err.to_string(), "Data error: test error");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MolPropError = io_err.into();
        assert!(matches!(err, MolPropError::IoError(_)));
    }

    #[test]
    fn test_stage_display_is_one_based() {
        let err = MolPropError::TrainingDiverged { epoch: 3, loss: f64::NAN }
            .at_stage(Stage::Fold { index: 1, total: 3 });
        assert!(err.to_string().starts_with("fold 2 of 3 failed"));
    }

    #[test]
    fn test_inner_stage_is_kept() {
        let err = MolPropError::InsufficientData("empty".into())
            .at_stage(Stage::Split)
            .at_stage(Stage::Search);
        assert_eq!(err.stage(), Some(Stage::Split));
        assert!(matches!(err.root_cause(), MolPropError::InsufficientData(_)));
    }

    #[test]
    fn test_ensemble_stage_display() {
        let err = MolPropError::ConfigError("epochs must be at least 1".into()).at_stage(Stage::Ensemble);
        assert!(err.to_string().starts_with("ensemble training failed"));
    }

    #[test]
    fn test_only_divergence_is_recoverable() {
        let diverged = MolPropError::TrainingDiverged { epoch: 0, loss: f64::INFINITY };
        assert!(diverged.is_recoverable_in_search());
        assert!(!MolPropError::DataError("x".into()).is_recoverable_in_search());
    }
}
