//! Feed-forward property regressor (MLP with dropout)
//!
//! Hidden layer widths shrink geometrically from the input width to the single
//! output, one hidden layer per unit of `capacity`. Training uses Adam on the
//! mean squared error with inverted dropout after every hidden layer.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use super::{ModelFactory, Regressor};
use crate::error::MolPropError;
use crate::hyperparams::Hyperparameters;

const LEAKY_SLOPE: f64 = 0.01;
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Activation function for hidden layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[serde(rename = "relu")]
    ReLU,
    #[default]
    #[serde(rename = "leaky_relu")]
    LeakyReLU,
    #[serde(rename = "tanh")]
    Tanh,
    #[serde(rename = "sigmoid")]
    Sigmoid,
    #[serde(rename = "linear")]
    Linear,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::ReLU => "relu",
            Activation::LeakyReLU => "leaky_relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Linear => "linear",
        }
    }

    fn apply(&self, z: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::ReLU => z.mapv(|v| v.max(0.0)),
            Activation::LeakyReLU => z.mapv(|v| if v > 0.0 { v } else { LEAKY_SLOPE * v }),
            Activation::Tanh => z.mapv(f64::tanh),
            Activation::Sigmoid => z.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Linear => z.clone(),
        }
    }

    fn derivative(&self, z: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::ReLU => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::LeakyReLU => z.mapv(|v| if v > 0.0 { 1.0 } else { LEAKY_SLOPE }),
            Activation::Tanh => z.mapv(|v| 1.0 - v.tanh().powi(2)),
            Activation::Sigmoid => z.mapv(|v| {
                let s = 1.0 / (1.0 + (-v).exp());
                s * (1.0 - s)
            }),
            Activation::Linear => Array2::ones(z.raw_dim()),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = MolPropError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::ReLU),
            "leaky_relu" | "leakyrelu" => Ok(Activation::LeakyReLU),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "linear" | "identity" => Ok(Activation::Linear),
            other => Err(MolPropError::ConfigValidation {
                name: "activation".to_string(),
                value: other.to_string(),
                reason: "expected one of relu, leaky_relu, tanh, sigmoid, linear".to_string(),
            }),
        }
    }
}

/// Layer widths from input to output, `n_hidden` geometric steps in between
fn layer_widths(input_dim: usize, output_dim: usize, n_hidden: usize) -> Vec<usize> {
    let ratio = (input_dim as f64 / output_dim as f64).powf(1.0 / (n_hidden + 1) as f64);
    let mut widths = Vec::with_capacity(n_hidden + 2);
    widths.push(input_dim);
    for i in 1..=n_hidden {
        let width = (input_dim as f64 / ratio.powi(i as i32)).round().max(1.0);
        widths.push(width as usize);
    }
    widths.push(output_dim);
    widths
}

#[derive(Debug, Clone)]
struct AdamState {
    t: i32,
    m_w: Vec<Array2<f64>>,
    v_w: Vec<Array2<f64>>,
    m_b: Vec<Array1<f64>>,
    v_b: Vec<Array1<f64>>,
}

impl AdamState {
    fn new(weights: &[Array2<f64>], biases: &[Array1<f64>]) -> Self {
        Self {
            t: 0,
            m_w: weights.iter().map(|w| Array2::zeros(w.raw_dim())).collect(),
            v_w: weights.iter().map(|w| Array2::zeros(w.raw_dim())).collect(),
            m_b: biases.iter().map(|b| Array1::zeros(b.len())).collect(),
            v_b: biases.iter().map(|b| Array1::zeros(b.len())).collect(),
        }
    }
}

struct ForwardPass {
    activations: Vec<Array2<f64>>,
    z_values: Vec<Array2<f64>>,
    masks: Vec<Option<Array2<f64>>>,
}

/// Multi-layer perceptron with a single regression output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpOut {
    input_dim: usize,
    hps: Hyperparameters,
    weights: Vec<Array2<f64>>,
    biases: Vec<Array1<f64>>,
    #[serde(skip)]
    adam: Option<AdamState>,
}

impl MlpOut {
    /// Create a freshly initialised model (Glorot uniform weights, zero biases)
    pub fn new(input_dim: usize, hps: Hyperparameters, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let widths = layer_widths(input_dim.max(1), 1, hps.capacity);

        let mut weights = Vec::with_capacity(widths.len() - 1);
        let mut biases = Vec::with_capacity(widths.len() - 1);
        for pair in widths.windows(2) {
            let (n_in, n_out) = (pair[0], pair[1]);
            let limit = (6.0 / (n_in + n_out) as f64).sqrt();
            weights.push(Array2::from_shape_fn((n_in, n_out), |_| {
                rng.gen::<f64>() * 2.0 * limit - limit
            }));
            biases.push(Array1::zeros(n_out));
        }

        Self {
            input_dim,
            hps,
            weights,
            biases,
            adam: None,
        }
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hps
    }

    /// Widths of every layer, input and output included
    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.input_dim];
        sizes.extend(self.biases.iter().map(|b| b.len()));
        sizes
    }

    fn dropout_mask(&self, shape: (usize, usize), rng: &mut dyn RngCore) -> Option<Array2<f64>> {
        let p = self.hps.dropout_pct;
        if p <= 0.0 {
            return None;
        }
        let keep = 1.0 - p;
        let mask = if keep <= 0.0 {
            Array2::zeros(shape)
        } else {
            Array2::from_shape_fn(shape, |_| if rng.gen::<f64>() < p { 0.0 } else { 1.0 / keep })
        };
        Some(mask)
    }

    fn forward(&self, x: &Array2<f64>, mut rng: Option<&mut dyn RngCore>) -> ForwardPass {
        let n_layers = self.weights.len();
        let mut activations = Vec::with_capacity(n_layers + 1);
        let mut z_values = Vec::with_capacity(n_layers);
        let mut masks = Vec::with_capacity(n_layers.saturating_sub(1));
        activations.push(x.clone());

        for (i, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let z = activations[i].dot(w) + b;
            let a = if i + 1 < n_layers {
                let mut a = self.hps.activation.apply(&z);
                let mask = match rng.as_deref_mut() {
                    Some(r) => self.dropout_mask(a.dim(), r),
                    None => None,
                };
                if let Some(m) = &mask {
                    a = a * m;
                }
                masks.push(mask);
                a
            } else {
                z.clone()
            };
            z_values.push(z);
            activations.push(a);
        }

        ForwardPass {
            activations,
            z_values,
            masks,
        }
    }

    fn output_column(pass: &ForwardPass) -> Array1<f64> {
        match pass.activations.last() {
            Some(out) => out.column(0).to_owned(),
            None => Array1::zeros(0),
        }
    }

    fn gradients(&self, pass: &ForwardPass, y: &Array1<f64>) -> Vec<(Array2<f64>, Array1<f64>)> {
        let n = y.len().max(1) as f64;
        let y_2d = y.clone().insert_axis(Axis(1));
        let output = &pass.activations[pass.activations.len() - 1];
        let mut delta = (output - &y_2d) * (2.0 / n);
        let mut gradients = Vec::with_capacity(self.weights.len());

        for i in (0..self.weights.len()).rev() {
            let grad_w = pass.activations[i].t().dot(&delta);
            let grad_b = delta.sum_axis(Axis(0));
            gradients.push((grad_w, grad_b));

            if i > 0 {
                let mut back = delta.dot(&self.weights[i].t())
                    * self.hps.activation.derivative(&pass.z_values[i - 1]);
                if let Some(mask) = &pass.masks[i - 1] {
                    back = back * mask;
                }
                delta = back;
            }
        }

        gradients.reverse();
        gradients
    }
}

impl Regressor for MlpOut {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Layer shapes must chain from `input_dim` to a single output
    fn validate(&self) -> crate::error::Result<()> {
        let shape_error = |expected: String, actual: String| MolPropError::ShapeError { expected, actual };
        if self.weights.is_empty() || self.weights.len() != self.biases.len() {
            return Err(shape_error(
                "one bias vector per weight matrix, at least one layer".to_string(),
                format!("{} weight matrices, {} bias vectors", self.weights.len(), self.biases.len()),
            ));
        }
        let mut width = self.input_dim;
        for (i, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            if w.nrows() != width || w.ncols() != b.len() {
                return Err(shape_error(
                    format!("layer {} of shape ({}, {}) with {} biases", i, width, w.ncols(), w.ncols()),
                    format!("({}, {}) with {} biases", w.nrows(), w.ncols(), b.len()),
                ));
            }
            width = w.ncols();
        }
        if width != 1 {
            return Err(shape_error("a single output".to_string(), format!("{} outputs", width)));
        }
        Ok(())
    }

    fn train_step(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        learning_rate: f64,
        rng: &mut dyn RngCore,
    ) -> f64 {
        let pass = self.forward(x, Some(rng));
        let output = Self::output_column(&pass);
        let loss = output
            .iter()
            .zip(y.iter())
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f64>()
            / y.len().max(1) as f64;
        if !loss.is_finite() {
            return loss;
        }

        let gradients = self.gradients(&pass, y);
        let state = self
            .adam
            .get_or_insert_with(|| AdamState::new(&self.weights, &self.biases));
        state.t += 1;
        let correction1 = 1.0 - ADAM_BETA1.powi(state.t);
        let correction2 = 1.0 - ADAM_BETA2.powi(state.t);
        let step = learning_rate * correction2.sqrt() / correction1;

        for (i, (grad_w, grad_b)) in gradients.into_iter().enumerate() {
            state.m_w[i] = &state.m_w[i] * ADAM_BETA1 + &grad_w * (1.0 - ADAM_BETA1);
            state.v_w[i] = &state.v_w[i] * ADAM_BETA2 + &grad_w.mapv(|g| g * g) * (1.0 - ADAM_BETA2);
            state.m_b[i] = &state.m_b[i] * ADAM_BETA1 + &grad_b * (1.0 - ADAM_BETA1);
            state.v_b[i] = &state.v_b[i] * ADAM_BETA2 + &grad_b.mapv(|g| g * g) * (1.0 - ADAM_BETA2);

            let update_w = &state.m_w[i] / &state.v_w[i].mapv(|v| v.sqrt() + ADAM_EPS);
            let update_b = &state.m_b[i] / &state.v_b[i].mapv(|v| v.sqrt() + ADAM_EPS);
            self.weights[i] = &self.weights[i] - &(update_w * step);
            self.biases[i] = &self.biases[i] - &(update_b * step);
        }

        loss
    }

    fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        Self::output_column(&self.forward(x, None))
    }

    fn predict_stochastic(&self, x: &Array2<f64>, rng: &mut dyn RngCore) -> Array1<f64> {
        Self::output_column(&self.forward(x, Some(rng)))
    }
}

/// Factory holding the hyperparameters every built model shares
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MlpFactory {
    pub input_dim: usize,
    pub hps: Hyperparameters,
}

impl MlpFactory {
    pub fn new(input_dim: usize, hps: Hyperparameters) -> Self {
        Self { input_dim, hps }
    }
}

impl ModelFactory for MlpFactory {
    type Model = MlpOut;

    fn build(&self, seed: u64) -> MlpOut {
        MlpOut::new(self.input_dim, self.hps, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hps(capacity: usize, dropout_pct: f64) -> Hyperparameters {
        Hyperparameters {
            r_learn: 0.01,
            batch_size: 16,
            dropout_pct,
            capacity,
            activation: Activation::LeakyReLU,
        }
    }

    fn create_regression_data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((64, 3), |(i, j)| ((i * 3 + j) % 17) as f64 / 17.0);
        let y: Array1<f64> = x
            .rows()
            .into_iter()
            .map(|row| row[0] * 2.0 - row[1] + 0.5 * row[2])
            .collect();
        (x, y)
    }

    #[test]
    fn test_layer_widths_shrink_geometrically() {
        assert_eq!(layer_widths(512, 1, 2), vec![512, 64, 8, 1]);
        assert_eq!(layer_widths(10, 1, 0), vec![10, 1]);
    }

    #[test]
    fn test_same_seed_same_model() {
        let a = MlpOut::new(8, hps(2, 0.0), 7);
        let b = MlpOut::new(8, hps(2, 0.0), 7);
        let x = Array2::from_elem((2, 8), 0.3);
        assert_eq!(a.predict(&x), b.predict(&x));
    }

    #[test]
    fn test_training_reduces_loss() {
        let (x, y) = create_regression_data();
        let mut model = MlpOut::new(3, hps(1, 0.0), 1);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);

        let first = model.train_step(&x, &y, 0.01, &mut rng);
        let mut last = first;
        for _ in 0..300 {
            last = model.train_step(&x, &y, 0.01, &mut rng);
        }
        assert!(last < first, "loss should drop: {} -> {}", first, last);
    }

    #[test]
    fn test_dropout_only_in_stochastic_prediction() {
        let model = MlpOut::new(4, hps(2, 0.5), 3);
        let x = Array2::from_elem((5, 4), 1.0);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);

        assert_eq!(model.predict(&x), model.predict(&x));
        let noisy_a = model.predict_stochastic(&x, &mut rng);
        let noisy_b = model.predict_stochastic(&x, &mut rng);
        assert_ne!(noisy_a, noisy_b);
    }

    #[test]
    fn test_activation_functions() {
        let z = Array2::from_shape_vec((1, 3), vec![-1.0, 0.0, 2.0]).unwrap();
        let relu = Activation::ReLU.apply(&z);
        assert_eq!(relu[[0, 0]], 0.0);
        let leaky = Activation::LeakyReLU.apply(&z);
        assert!((leaky[[0, 0]] + 0.01).abs() < 1e-12);
        assert_eq!(leaky[[0, 2]], 2.0);
        let sigmoid = Activation::Sigmoid.apply(&z);
        assert!((sigmoid[[0, 1]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_activation_parse() {
        assert_eq!("leaky_relu".parse::<Activation>().unwrap(), Activation::LeakyReLU);
        assert!("swish".parse::<Activation>().is_err());
    }

    #[test]
    fn test_serde_round_trip_keeps_predictions() {
        let model = MlpOut::new(6, hps(2, 0.1), 5);
        let json = serde_json::to_string(&model).unwrap();
        let restored: MlpOut = serde_json::from_str(&json).unwrap();
        let x = Array2::from_elem((3, 6), 0.25);
        assert_eq!(model.predict(&x), restored.predict(&x));
    }

    #[test]
    fn test_fresh_model_is_consistent() {
        assert!(MlpOut::new(12, hps(3, 0.0), 1).validate().is_ok());
        assert!(MlpOut::new(5, hps(0, 0.0), 1).validate().is_ok());
    }

    #[test]
    fn test_mismatched_layers_rejected() {
        let mut model = MlpOut::new(8, hps(2, 0.0), 4);
        model.weights[1] = model.weights[0].clone();
        assert!(matches!(model.validate(), Err(MolPropError::ShapeError { .. })));

        let mut model = MlpOut::new(8, hps(1, 0.0), 4);
        model.biases.pop();
        assert!(model.validate().is_err());

        let mut model = MlpOut::new(8, hps(1, 0.0), 4);
        model.input_dim = 9;
        assert!(model.validate().is_err());
    }
}
