//! Submodel and ensemble training
//!
//! - [`MinibatchTrainer`] trains one model and keeps its best validation epoch
//! - [`EnsembleTrainer`] trains one submodel per fold and persists them
//! - [`ArtifactStore`] owns the on-disk layout of a property group

mod config;
mod ensemble;
pub mod persistence;
mod trainer;

pub use config::TrainConfig;
pub use ensemble::{train_kfold_ensemble, EnsembleDataset, EnsembleRun, EnsembleTrainer, FoldResult};
pub use persistence::{ArtifactStore, EnsembleManifest, FeatureArtifact, OofPrediction};
pub use trainer::{train_submodel, EpochRecord, MinibatchTrainer, SubmodelTrainer, TrainOutcome};
