//! Held-out error and uncertainty statistics

use std::collections::BTreeMap;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MolPropError, Result};
use crate::inference::EnsemblePrediction;

/// Root mean squared error, NaN for empty input
pub fn rmse(predictions: &Array1<f64>, targets: &Array1<f64>) -> f64 {
    if targets.is_empty() {
        return f64::NAN;
    }
    let mse = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (p - t).powi(2))
        .sum::<f64>()
        / targets.len() as f64;
    mse.sqrt()
}

/// Regression error statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub n: usize,
    pub rmse: f64,
    pub mae: f64,
    /// Coefficient of determination, 0 when the targets are constant
    pub r2: f64,
}

impl RegressionMetrics {
    pub fn compute(targets: &[f64], predictions: &[f64]) -> Result<Self> {
        if targets.len() != predictions.len() {
            return Err(MolPropError::ShapeError {
                expected: format!("{} predictions", targets.len()),
                actual: predictions.len().to_string(),
            });
        }
        if targets.is_empty() {
            return Err(MolPropError::InsufficientData("no targets to score".to_string()));
        }

        let n = targets.len() as f64;
        let errors: Vec<f64> = targets.iter().zip(predictions).map(|(t, p)| t - p).collect();
        let ss_res: f64 = errors.iter().map(|e| e * e).sum();
        let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;

        let mean = targets.iter().sum::<f64>() / n;
        let ss_tot: f64 = targets.iter().map(|t| (t - mean).powi(2)).sum();
        let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

        Ok(Self {
            n: targets.len(),
            rmse: (ss_res / n).sqrt(),
            mae,
            r2,
        })
    }
}

/// How well the ensemble spread covers the actual errors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyMetrics {
    /// Fraction of targets within one std of the mean
    pub coverage_1sigma: f64,
    /// Fraction of targets within two std of the mean
    pub coverage_2sigma: f64,
    pub mean_std: f64,
}

impl UncertaintyMetrics {
    pub fn compute(targets: &[f64], mean: &[f64], std: &[f64]) -> Result<Self> {
        if targets.is_empty() {
            return Err(MolPropError::InsufficientData("no targets to score".to_string()));
        }
        let n = targets.len() as f64;
        let within = |k: f64| {
            targets
                .iter()
                .zip(mean)
                .zip(std)
                .filter(|((t, m), s)| (*t - *m).abs() <= k * **s)
                .count() as f64
                / n
        };
        Ok(Self {
            coverage_1sigma: within(1.0),
            coverage_2sigma: within(2.0),
            mean_std: std.iter().sum::<f64>() / n,
        })
    }
}

/// Error and uncertainty statistics for one slice of the predictions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropertyMetrics {
    pub regression: RegressionMetrics,
    pub uncertainty: UncertaintyMetrics,
}

impl PropertyMetrics {
    fn compute(targets: &[f64], mean: &[f64], std: &[f64]) -> Result<Self> {
        Ok(Self {
            regression: RegressionMetrics::compute(targets, mean)?,
            uncertainty: UncertaintyMetrics::compute(targets, mean, std)?,
        })
    }
}

/// Metrics per property and over all rows of an [`EnsemblePrediction`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub overall: PropertyMetrics,
    pub by_property: BTreeMap<String, PropertyMetrics>,
}

impl MetricsReport {
    /// Rows without a finite target are left out
    pub fn from_prediction(prediction: &EnsemblePrediction) -> Result<Self> {
        let rows: Vec<usize> = (0..prediction.len())
            .filter(|&i| prediction.targets[i].is_finite())
            .collect();
        if rows.is_empty() {
            return Err(MolPropError::InsufficientData(
                "no rows with a finite target to score".to_string(),
            ));
        }

        let gather = |idx: &[usize]| {
            let pick = |v: &[f64]| idx.iter().map(|&i| v[i]).collect::<Vec<f64>>();
            (pick(&prediction.targets), pick(&prediction.mean), pick(&prediction.std))
        };

        let (t, m, s) = gather(&rows);
        let overall = PropertyMetrics::compute(&t, &m, &s)?;

        let mut per_prop: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &i in &rows {
            per_prop.entry(prediction.selectors[i].as_str()).or_default().push(i);
        }
        let mut by_property = BTreeMap::new();
        for (prop, idx) in per_prop {
            let (t, m, s) = gather(&idx);
            by_property.insert(prop.to_string(), PropertyMetrics::compute(&t, &m, &s)?);
        }

        Ok(Self { overall, by_property })
    }

    pub fn log(&self, group: &str) {
        for (prop, metrics) in &self.by_property {
            info!(
                group,
                prop = %prop,
                n = metrics.regression.n,
                rmse = metrics.regression.rmse,
                mae = metrics.regression.mae,
                r2 = metrics.regression.r2,
                coverage_1sigma = metrics.uncertainty.coverage_1sigma,
                mean_std = metrics.uncertainty.mean_std,
                "test metrics"
            );
        }
        info!(
            group,
            n = self.overall.regression.n,
            rmse = self.overall.regression.rmse,
            r2 = self.overall.regression.r2,
            "overall test metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::PredictionScale;

    #[test]
    fn test_perfect_predictions() {
        let targets = [1.0, 2.0, 3.0];
        let metrics = RegressionMetrics::compute(&targets, &targets).unwrap();
        assert_eq!(metrics.rmse, 0.0);
        assert_eq!(metrics.mae, 0.0);
        assert!((metrics.r2 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_known_errors() {
        let metrics = RegressionMetrics::compute(&[0.0, 0.0], &[1.0, -3.0]).unwrap();
        assert!((metrics.rmse - 5.0f64.sqrt()).abs() < 1e-12);
        assert!((metrics.mae - 2.0).abs() < 1e-12);
        assert_eq!(metrics.r2, 0.0);
    }

    #[test]
    fn test_coverage() {
        let unc = UncertaintyMetrics::compute(&[0.0, 0.0, 0.0, 0.0], &[0.5, 1.5, 3.0, 0.0], &[1.0; 4])
            .unwrap();
        assert!((unc.coverage_1sigma - 0.5).abs() < 1e-12);
        assert!((unc.coverage_2sigma - 0.75).abs() < 1e-12);
        assert_eq!(unc.mean_std, 1.0);
    }

    #[test]
    fn test_report_groups_by_property_and_skips_missing_targets() {
        let prediction = EnsemblePrediction {
            smiles: vec!["C".into(), "CC".into(), "CCC".into()],
            selectors: vec!["a".into(), "b".into(), "a".into()],
            targets: vec![1.0, 2.0, f64::NAN],
            mean: vec![1.5, 2.0, 0.0],
            std: vec![0.5, 0.1, 0.2],
            scale: PredictionScale::Scaled,
            n_predictions: 3,
            dropped: Vec::new(),
        };
        let report = MetricsReport::from_prediction(&prediction).unwrap();
        assert_eq!(report.overall.regression.n, 2);
        assert_eq!(report.by_property.len(), 2);
        assert!((report.by_property["a"].regression.rmse - 0.5).abs() < 1e-12);
        assert_eq!(report.by_property["b"].regression.rmse, 0.0);
    }

    #[test]
    fn test_rmse_helper() {
        let p = Array1::from(vec![1.0, 3.0]);
        let t = Array1::from(vec![1.0, 1.0]);
        assert!((rmse(&p, &t) - 2.0f64.sqrt()).abs() < 1e-12);
        assert!(rmse(&Array1::zeros(0), &Array1::zeros(0)).is_nan());
    }
}
