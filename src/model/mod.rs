//! Model capability interfaces
//!
//! The pipeline only talks to models through [`Regressor`] and builds fresh
//! instances through a [`ModelFactory`]. [`MlpOut`] is the bundled
//! implementation; any other regressor satisfying the trait can be swapped in.

mod mlp;

pub use mlp::{Activation, MlpFactory, MlpOut};

use ndarray::{Array1, Array2};
use rand::RngCore;

use crate::error::Result;

/// A single-output regression model trained by minibatch steps
pub trait Regressor: Send + Sync {
    /// Expected number of input columns
    fn input_dim(&self) -> usize;

    /// Check internal consistency of a model that was deserialized
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// One optimisation step on a minibatch with stochastic regularisation
    /// active. Returns the minibatch MSE before the update.
    fn train_step(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        learning_rate: f64,
        rng: &mut dyn RngCore,
    ) -> f64;

    /// Deterministic prediction (stochastic regularisation off)
    fn predict(&self, x: &Array2<f64>) -> Array1<f64>;

    /// Prediction with stochastic regularisation left active
    fn predict_stochastic(&self, x: &Array2<f64>, rng: &mut dyn RngCore) -> Array1<f64> {
        let _ = rng;
        self.predict(x)
    }
}

/// Builds fresh, untrained model instances
pub trait ModelFactory: Sync {
    type Model: Regressor + Clone;

    /// A new model whose initial parameters are derived from `seed`
    fn build(&self, seed: u64) -> Self::Model;
}
