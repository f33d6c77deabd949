//! Hyperparameter optimization
//!
//! Bayesian optimization with a Gaussian Process surrogate over a
//! box-constrained search space:
//! - warm-up points from a seeded random or Latin hypercube design
//! - Matern kernel with the length scale chosen by marginal likelihood
//! - expected improvement, probability of improvement or lower confidence bound
//! - penalised scoring of diverged trials

mod config;
pub mod gaussian_process;
mod optimizer;
mod search_space;

pub use config::{InitialPoints, SearchConfig};
pub use gaussian_process::{Acquisition, GaussianProcess, KernelType};
pub use optimizer::{BayesianSearch, SearchResult, Trial, TrialStatus};
pub use search_space::{Dimension, DimensionType, ParameterValue, SearchSpace, TrialParams};
