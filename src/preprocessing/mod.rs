//! Target preprocessing
//!
//! Property values are scaled per property before training so that a
//! multi-property group trains on comparable magnitudes.

mod scaler;

pub use scaler::{ScalerDict, ScalerParams, ScalerType};
