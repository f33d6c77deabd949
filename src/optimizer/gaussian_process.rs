//! Gaussian Process surrogate for Bayesian Optimization
//!
//! GP regression on the unit hypercube with a Matern kernel, normalised
//! targets and a Cholesky solve. The kernel length scale is picked from a
//! fixed grid by log marginal likelihood at every fit.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{MolPropError, Result};

/// Kernel function types for Gaussian Process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum KernelType {
    /// Radial Basis Function (Squared Exponential)
    RBF { length_scale: f64 },
    /// Matern kernel with nu in {0.5, 1.5, 2.5}
    Matern { nu: f64, length_scale: f64 },
}

impl Default for KernelType {
    fn default() -> Self {
        KernelType::Matern {
            nu: 2.5,
            length_scale: 1.0,
        }
    }
}

impl KernelType {
    pub fn length_scale(&self) -> f64 {
        match self {
            KernelType::RBF { length_scale } | KernelType::Matern { length_scale, .. } => *length_scale,
        }
    }

    pub fn with_length_scale(self, length_scale: f64) -> Self {
        match self {
            KernelType::RBF { .. } => KernelType::RBF { length_scale },
            KernelType::Matern { nu, .. } => KernelType::Matern { nu, length_scale },
        }
    }

    /// Kernel value between two points
    fn value(&self, x1: ArrayView1<f64>, x2: ArrayView1<f64>) -> f64 {
        let dist_sq: f64 = x1.iter().zip(x2.iter()).map(|(a, b)| (a - b).powi(2)).sum();
        match *self {
            KernelType::RBF { length_scale } => (-0.5 * dist_sq / (length_scale * length_scale)).exp(),
            KernelType::Matern { nu, length_scale } => {
                let r = dist_sq.sqrt() / length_scale;
                if r < 1e-12 {
                    return 1.0;
                }
                if (nu - 0.5).abs() < 1e-6 {
                    (-r).exp()
                } else if (nu - 1.5).abs() < 1e-6 {
                    let sqrt3 = 3.0_f64.sqrt();
                    (1.0 + sqrt3 * r) * (-sqrt3 * r).exp()
                } else {
                    let sqrt5 = 5.0_f64.sqrt();
                    (1.0 + sqrt5 * r + 5.0 / 3.0 * r * r) * (-sqrt5 * r).exp()
                }
            }
        }
    }

    fn matrix(&self, x1: &Array2<f64>, x2: &Array2<f64>) -> Array2<f64> {
        Array2::from_shape_fn((x1.nrows(), x2.nrows()), |(i, j)| self.value(x1.row(i), x2.row(j)))
    }
}

/// Acquisition function for minimisation. Higher values are more promising.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Acquisition {
    ExpectedImprovement { xi: f64 },
    ProbabilityOfImprovement { xi: f64 },
    LowerConfidenceBound { kappa: f64 },
}

impl Default for Acquisition {
    fn default() -> Self {
        Acquisition::ExpectedImprovement { xi: 0.01 }
    }
}

impl Acquisition {
    /// Score a posterior `(mean, variance)` against the best observed value
    pub fn value(&self, mean: f64, var: f64, best: f64) -> f64 {
        let std = var.max(0.0).sqrt().max(1e-12);
        match *self {
            Acquisition::ExpectedImprovement { xi } => {
                let improvement = best - mean - xi;
                let z = improvement / std;
                improvement * normal_cdf(z) + std * normal_pdf(z)
            }
            Acquisition::ProbabilityOfImprovement { xi } => normal_cdf((best - mean - xi) / std),
            Acquisition::LowerConfidenceBound { kappa } => -(mean - kappa * std),
        }
    }
}

#[derive(Debug, Clone)]
struct FittedState {
    x_train: Array2<f64>,
    l_chol: Array2<f64>,
    alpha: Array1<f64>,
    log_marginal_likelihood: f64,
}

/// Gaussian Process model for regression
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kernel: KernelType,
    noise: f64,
    length_scales: Vec<f64>,
    y_mean: f64,
    y_std: f64,
    state: Option<FittedState>,
}

impl GaussianProcess {
    pub fn new(kernel: KernelType) -> Self {
        Self {
            kernel,
            noise: 1e-6,
            length_scales: Vec::new(),
            y_mean: 0.0,
            y_std: 1.0,
            state: None,
        }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(1e-10);
        self
    }

    /// Candidate length scales tried at every fit. Empty keeps the kernel's own.
    pub fn with_length_scales(mut self, grid: Vec<f64>) -> Self {
        self.length_scales = grid.into_iter().filter(|l| l.is_finite() && *l > 0.0).collect();
        self
    }

    pub fn kernel(&self) -> KernelType {
        self.kernel
    }

    pub fn log_marginal_likelihood(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.log_marginal_likelihood)
    }

    /// Fit to `(x, y)`, choosing the length scale with the highest log marginal likelihood
    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        let n = y.len();
        if n == 0 || x.nrows() != n {
            return Err(MolPropError::ShapeError {
                expected: format!("{} rows", n),
                actual: format!("{} rows", x.nrows()),
            });
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(MolPropError::OptimizationError(
                "surrogate targets must be finite".to_string(),
            ));
        }

        self.y_mean = y.mean().unwrap_or(0.0);
        self.y_std = y.std(0.0);
        if self.y_std < 1e-10 {
            self.y_std = 1.0;
        }
        let y_normalized = y.mapv(|v| (v - self.y_mean) / self.y_std);

        let candidates: Vec<KernelType> = if self.length_scales.is_empty() {
            vec![self.kernel]
        } else {
            self.length_scales
                .iter()
                .map(|&l| self.kernel.with_length_scale(l))
                .collect()
        };

        let mut best: Option<(KernelType, FittedState)> = None;
        for kernel in candidates {
            let state = self.fit_kernel(kernel, x, &y_normalized);
            let better = best
                .as_ref()
                .map_or(true, |(_, b)| state.log_marginal_likelihood > b.log_marginal_likelihood);
            if better {
                best = Some((kernel, state));
            }
        }

        let (kernel, state) = best.ok_or_else(|| {
            MolPropError::OptimizationError("no kernel candidate could be fitted".to_string())
        })?;
        self.kernel = kernel;
        self.state = Some(state);
        Ok(())
    }

    fn fit_kernel(&self, kernel: KernelType, x: &Array2<f64>, y: &Array1<f64>) -> FittedState {
        let n = y.len();
        let mut k = kernel.matrix(x, x);
        for i in 0..n {
            k[[i, i]] += self.noise;
        }
        let l = cholesky(&k);
        let alpha = solve_triangular_system(&l, y);

        let log_det: f64 = (0..n).map(|i| l[[i, i]].ln()).sum();
        let lml = -0.5 * y.dot(&alpha) - log_det - 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();

        FittedState {
            x_train: x.clone(),
            l_chol: l,
            alpha,
            log_marginal_likelihood: if lml.is_finite() { lml } else { f64::NEG_INFINITY },
        }
    }

    /// Posterior mean and variance at test points, in target units
    pub fn predict(&self, x_test: &Array2<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        let state = self.state.as_ref().ok_or(MolPropError::ModelNotFitted)?;
        let k_star = self.kernel.matrix(x_test, &state.x_train);
        let mean = k_star.dot(&state.alpha).mapv(|m| m * self.y_std + self.y_mean);

        let mut var = Array1::zeros(x_test.nrows());
        for i in 0..x_test.nrows() {
            let k_self = self.kernel.value(x_test.row(i), x_test.row(i));
            let v = solve_lower_triangular(&state.l_chol, &k_star.row(i).to_owned());
            var[i] = (k_self - v.dot(&v)).max(1e-12) * self.y_std * self.y_std;
        }

        Ok((mean, var))
    }
}

/// Cholesky factor with the diagonal floored for near-singular inputs
fn cholesky(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let mut l = Array2::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            if i == j {
                for k in 0..j {
                    sum += l[[j, k]] * l[[j, k]];
                }
                l[[j, j]] = (a[[j, j]] - sum).max(1e-10).sqrt();
            } else {
                for k in 0..j {
                    sum += l[[i, k]] * l[[j, k]];
                }
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    l
}

/// Solve L x = b for lower triangular L
fn solve_lower_triangular(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solve L L^T x = b
fn solve_triangular_system(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let y = solve_lower_triangular(l, b);
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Standard normal CDF
pub(crate) fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Standard normal PDF
pub(crate) fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Error function approximation (Abramowitz and Stegun 7.1.26)
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}
