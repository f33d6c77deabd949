//! Ensemble inference
//!
//! An [`Ensemble`] is loaded from a trained group directory and evaluated
//! with [`eval_ensemble`]: the mean across submodels is the prediction and
//! their sample standard deviation is the uncertainty. Monte Carlo mode keeps
//! dropout active so the spread also reflects variance within each member.

mod config;
mod engine;

pub use config::{EnsembleOptions, PredictionScale};
pub use engine::{eval_ensemble, Ensemble, EnsemblePrediction};
