//! Single submodel training

use ndarray::Axis;
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use super::config::TrainConfig;
use crate::data::{FeatureLayout, PreparedData, PropertyGroup, Record};
use crate::error::{MolPropError, Result};
use crate::metrics::rmse;
use crate::model::Regressor;
use crate::preprocessing::ScalerDict;

/// Loss and validation error after one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean minibatch MSE on scaled targets
    pub train_loss: f64,
    /// Validation RMSE on scaled targets, if evaluated this epoch
    pub val_rmse: Option<f64>,
}

/// Result of a submodel training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    /// Lowest validation RMSE over all evaluated epochs
    pub best_val_rmse: f64,
    pub best_epoch: usize,
    pub epochs_run: usize,
    pub history: Vec<EpochRecord>,
    pub duration_secs: f64,
}

/// Trains one model on a training set, scored on a validation set
pub trait SubmodelTrainer {
    /// Train `model` in place and leave it holding its best-validation parameters
    fn train<M: Regressor + Clone>(
        &self,
        model: &mut M,
        train: &PreparedData,
        val: &PreparedData,
        config: &TrainConfig,
        rng: &mut dyn RngCore,
    ) -> Result<TrainOutcome>;
}

/// Shuffled minibatch training with best-epoch restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinibatchTrainer {
    /// Stop after this many evaluations without improvement
    pub patience: Option<usize>,
}

impl MinibatchTrainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = Some(patience);
        self
    }

    fn check_inputs<M: Regressor>(model: &M, train: &PreparedData, val: &PreparedData) -> Result<()> {
        if train.is_empty() {
            return Err(MolPropError::InsufficientData("empty training set".to_string()));
        }
        if val.is_empty() {
            return Err(MolPropError::InsufficientData("empty validation set".to_string()));
        }
        for (name, data) in [("training", train), ("validation", val)] {
            if data.n_features() != model.input_dim() {
                return Err(MolPropError::DataError(format!(
                    "{} set has {} columns, model expects {}",
                    name,
                    data.n_features(),
                    model.input_dim()
                )));
            }
        }
        Ok(())
    }
}

impl SubmodelTrainer for MinibatchTrainer {
    fn train<M: Regressor + Clone>(
        &self,
        model: &mut M,
        train: &PreparedData,
        val: &PreparedData,
        config: &TrainConfig,
        rng: &mut dyn RngCore,
    ) -> Result<TrainOutcome> {
        config.validate()?;
        Self::check_inputs(model, train, val)?;

        let start = Instant::now();
        let n = train.len();
        let batch_size = config.hps.batch_size.clamp(1, n);
        let mut order: Vec<usize> = (0..n).collect();

        let mut history = Vec::with_capacity(config.epochs);
        let mut best: Option<(f64, usize, M)> = None;
        let mut stale = 0usize;

        for epoch in 0..config.epochs {
            order.shuffle(rng);

            let mut loss_sum = 0.0;
            for batch in order.chunks(batch_size) {
                let x = train.x.select(Axis(0), batch);
                let y = train.y.select(Axis(0), batch);
                let loss = model.train_step(&x, &y, config.hps.r_learn, &mut *rng);
                if !loss.is_finite() {
                    return Err(MolPropError::TrainingDiverged { epoch, loss });
                }
                loss_sum += loss * batch.len() as f64;
            }
            let train_loss = loss_sum / n as f64;

            let val_rmse = if config.evaluates_at(epoch) {
                let score = rmse(&model.predict(&val.x), &val.y);
                if !score.is_finite() {
                    return Err(MolPropError::TrainingDiverged { epoch, loss: score });
                }
                Some(score)
            } else {
                None
            };
            history.push(EpochRecord {
                epoch,
                train_loss,
                val_rmse,
            });

            if let Some(score) = val_rmse {
                debug!(epoch, train_loss, val_rmse = score, "epoch");
                let improved = best.as_ref().map_or(true, |(b, _, _)| score < *b);
                if improved {
                    best = Some((score, epoch, model.clone()));
                    stale = 0;
                } else {
                    stale += 1;
                    if self.patience.is_some_and(|p| stale >= p) {
                        debug!(epoch, "early stopping");
                        break;
                    }
                }
            }
        }

        let epochs_run = history.len();
        let (best_val_rmse, best_epoch, snapshot) = best.ok_or_else(|| {
            MolPropError::InsufficientData("no validation pass was run".to_string())
        })?;
        *model = snapshot;

        Ok(TrainOutcome {
            best_val_rmse,
            best_epoch,
            epochs_run,
            history,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }
}

/// Prepare matrices from featurized records, then train with [`MinibatchTrainer`]
#[allow(clippy::too_many_arguments)]
pub fn train_submodel<M: Regressor + Clone>(
    model: &mut M,
    train_records: &[Record],
    val_records: &[Record],
    layout: &FeatureLayout,
    group: &PropertyGroup,
    scalers: &ScalerDict,
    config: &TrainConfig,
    rng: &mut dyn RngCore,
) -> Result<TrainOutcome> {
    if config.multi_head != (layout.selector_dim > 0) {
        return Err(MolPropError::ConfigError(format!(
            "multi_head is {} but group '{}' has selector width {}",
            config.multi_head, group.name, layout.selector_dim
        )));
    }
    let train = PreparedData::from_records(train_records, layout, group, Some(scalers))?;
    let val = PreparedData::from_records(val_records, layout, group, Some(scalers))?;
    MinibatchTrainer::new().train(model, &train, &val, config, rng)
}
