//! Ensemble loading and prediction

use std::path::Path;

use polars::prelude::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::{EnsembleOptions, PredictionScale};
use crate::data::{FeatureLayout, PreparedData, PropertyGroup, Record};
use crate::error::{MolPropError, Result, Stage, StageContext};
use crate::featurize::{featurize_records, DroppedRecord, FeatureEncoder};
use crate::hyperparams::Hyperparameters;
use crate::model::Regressor;
use crate::preprocessing::ScalerDict;
use crate::training::persistence::{ArtifactStore, HYPERPARAMS_FILE, MODELS_DIR, MODEL_FILE};

/// Submodels sharing one set of hyperparameters, scalers and input layout
#[derive(Debug, Clone)]
pub struct Ensemble<M> {
    members: Vec<M>,
    hps: Hyperparameters,
    scalers: ScalerDict,
    layout: FeatureLayout,
    group: PropertyGroup,
}

impl<M: Regressor> Ensemble<M> {
    pub fn new(
        members: Vec<M>,
        hps: Hyperparameters,
        scalers: ScalerDict,
        layout: FeatureLayout,
        group: PropertyGroup,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(MolPropError::InsufficientData("an ensemble needs at least one member".to_string()));
        }
        for member in &members {
            member.validate()?;
        }
        if let Some(bad) = members.iter().find(|m| m.input_dim() != layout.input_dim()) {
            return Err(MolPropError::ShapeError {
                expected: format!("{} model inputs", layout.input_dim()),
                actual: format!("member with {} inputs", bad.input_dim()),
            });
        }
        Ok(Self {
            members,
            hps,
            scalers,
            layout,
            group,
        })
    }

    pub fn members(&self) -> &[M] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hps
    }

    pub fn scalers(&self) -> &ScalerDict {
        &self.scalers
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    pub fn group(&self) -> &PropertyGroup {
        &self.group
    }
}

impl<M: Regressor + DeserializeOwned> Ensemble<M> {
    /// Load a complete ensemble written by the ensemble trainer
    ///
    /// Requires the manifest and exactly as many member artifacts as it lists.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let store = ArtifactStore::new(dir.as_ref());
        let manifest = store.read_manifest()?;

        let on_disk = store.count_fold_dirs(MODELS_DIR)?;
        if on_disk != manifest.n_folds {
            return Err(MolPropError::persistence(
                store.path(MODELS_DIR),
                format!("manifest lists {} folds, found {}", manifest.n_folds, on_disk),
            ));
        }

        let members = (0..manifest.n_folds)
            .map(|i| {
                let path = ArtifactStore::fold_dir(MODELS_DIR, i).join(MODEL_FILE);
                let member: M = store.read_json(&path)?;
                member
                    .validate()
                    .map_err(|e| MolPropError::persistence(store.path(&path), e))?;
                Ok(member)
            })
            .collect::<Result<Vec<M>>>()?;
        let hps = store.read_hyperparams(HYPERPARAMS_FILE)?;
        let scalers = store.read_scalers()?;

        info!(
            group = %manifest.group.name,
            members = members.len(),
            path = %store.root().display(),
            "loaded ensemble"
        );
        Self::new(members, hps, scalers, manifest.layout, manifest.group)
    }
}

/// Per-record ensemble mean and spread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub smiles: Vec<String>,
    /// Property of each row, in input order
    pub selectors: Vec<String>,
    /// NaN where the record carried no target
    pub targets: Vec<f64>,
    pub mean: Vec<f64>,
    /// Sample standard deviation across all collected predictions
    pub std: Vec<f64>,
    pub scale: PredictionScale,
    /// Predictions collected per row
    pub n_predictions: usize,
    pub dropped: Vec<DroppedRecord>,
}

impl EnsemblePrediction {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        Ok(DataFrame::new(vec![
            Series::new("smiles".into(), self.smiles.clone()).into(),
            Series::new("prop".into(), self.selectors.clone()).into(),
            Series::new("target".into(), self.targets.clone()).into(),
            Series::new("mean".into(), self.mean.clone()).into(),
            Series::new("std".into(), self.std.clone()).into(),
        ])?)
    }
}

/// Welford accumulator; identical inputs give exactly zero spread
#[derive(Debug, Clone, Copy, Default)]
struct RunningStats {
    n: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            (self.m2 / (self.n - 1) as f64).sqrt()
        }
    }
}

/// Predict `records` with every member and aggregate per record
///
/// Records without features are featurized with `featurizer` first. The
/// returned values are in the scale `options.scale` names.
pub fn eval_ensemble<M, E>(
    ensemble: &Ensemble<M>,
    records: &[Record],
    featurizer: &E,
    options: &EnsembleOptions,
) -> Result<EnsemblePrediction>
where
    M: Regressor,
    E: FeatureEncoder + ?Sized,
{
    options.validate()?;
    let outcome = featurize_records(records.to_vec(), featurizer, &ensemble.layout, options.featurization)
        .stage(Stage::Featurization)?;
    if !outcome.dropped.is_empty() {
        warn!(dropped = outcome.dropped.len(), "records dropped before prediction");
    }
    let kept = outcome.records;
    if kept.is_empty() {
        return Err(MolPropError::InsufficientData("no records left to predict".to_string()));
    }

    let prepared = PreparedData::from_records(&kept, &ensemble.layout, &ensemble.group, None)?;
    let mut stats = vec![RunningStats::default(); kept.len()];
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(options.seed);
    for member in &ensemble.members {
        for _ in 0..options.passes_per_member() {
            let predictions = if options.monte_carlo {
                member.predict_stochastic(&prepared.x, &mut rng)
            } else {
                member.predict(&prepared.x)
            };
            for (acc, value) in stats.iter_mut().zip(predictions.iter()) {
                acc.push(*value);
            }
        }
    }

    let scalers = &ensemble.scalers;
    let mut targets = Vec::with_capacity(kept.len());
    let mut mean = Vec::with_capacity(kept.len());
    let mut std = Vec::with_capacity(kept.len());
    for (record, acc) in kept.iter().zip(&stats) {
        match options.scale {
            PredictionScale::Scaled => {
                targets.push(scalers.transform(&record.prop, record.value)?);
                mean.push(acc.mean);
                std.push(acc.std());
            }
            PredictionScale::Original => {
                targets.push(record.value);
                mean.push(scalers.inverse_transform(&record.prop, acc.mean)?);
                std.push(acc.std() * scalers.scale_factor(&record.prop)?.abs());
            }
        }
    }

    Ok(EnsemblePrediction {
        smiles: kept.iter().map(|r| r.smiles.clone()).collect(),
        selectors: kept.iter().map(|r| r.prop.clone()).collect(),
        targets,
        mean,
        std,
        scale: options.scale,
        n_predictions: ensemble.len() * options.passes_per_member(),
        dropped: outcome.dropped,
    })
}
