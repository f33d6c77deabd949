//! k-fold ensemble training
//!
//! Each fold trains a fresh model on the other folds and validates on its
//! own, so every record gets exactly one out-of-fold prediction. Submodels
//! are written to a staging directory and only promoted to `models/` once
//! every fold has succeeded.

use std::time::Instant;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use super::config::TrainConfig;
use super::persistence::{
    ArtifactStore, EnsembleManifest, OofPrediction, HYPERPARAMS_FILE, MODEL_FILE, STAGING_DIR,
};
use super::trainer::{MinibatchTrainer, SubmodelTrainer, TrainOutcome};
use crate::data::{make_folds, FeatureLayout, FoldAssignment, PreparedData, PropertyGroup, Record};
use crate::error::{MolPropError, Result, Stage, StageContext};
use crate::model::{ModelFactory, Regressor};
use crate::preprocessing::ScalerDict;

/// Offset between the model-init and shuffle streams of a fold
const SHUFFLE_STREAM: u64 = 0xD1B5_4A32_D192_ED03;

/// Featurized training records of one property group
#[derive(Debug, Clone, Copy)]
pub struct EnsembleDataset<'a> {
    pub records: &'a [Record],
    pub layout: &'a FeatureLayout,
    pub group: &'a PropertyGroup,
    pub scalers: &'a ScalerDict,
}

/// One trained fold
#[derive(Debug, Clone)]
pub struct FoldResult<M> {
    pub fold_idx: usize,
    pub model: M,
    pub outcome: TrainOutcome,
    /// (record index, scaled prediction) for the fold's own records
    pub oof: Vec<(usize, f64)>,
}

/// A complete, persisted ensemble
#[derive(Debug, Clone)]
pub struct EnsembleRun<M> {
    /// Trained submodels by fold index
    pub members: Vec<M>,
    pub outcomes: Vec<TrainOutcome>,
    pub folds: FoldAssignment,
    /// Out-of-fold predictions ordered by record index
    pub oof: Vec<OofPrediction>,
    pub manifest: EnsembleManifest,
}

impl<M> EnsembleRun<M> {
    pub fn fold_scores(&self) -> &[f64] {
        &self.manifest.fold_scores
    }
}

/// Trains and persists one submodel per fold
#[derive(Debug, Clone, Copy)]
pub struct EnsembleTrainer {
    pub n_folds: usize,
    pub seed: u64,
    /// Train folds concurrently on the device's worker threads
    pub parallel: bool,
    pub trainer: MinibatchTrainer,
}

impl EnsembleTrainer {
    pub fn new(n_folds: usize, seed: u64) -> Self {
        Self {
            n_folds,
            seed,
            parallel: false,
            trainer: MinibatchTrainer::default(),
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_trainer(mut self, trainer: MinibatchTrainer) -> Self {
        self.trainer = trainer;
        self
    }

    /// Seed of the model built for `fold_idx`
    pub fn fold_seed(&self, fold_idx: usize) -> u64 {
        self.seed
            .wrapping_add(0x9E37_79B9_7F4A_7C15u64.wrapping_mul(fold_idx as u64 + 1))
    }

    /// Train every fold and persist the ensemble under `store`
    ///
    /// Any manifest already under `store` is removed first. Fails as a whole
    /// if any fold fails; the error names the fold and no manifest is written.
    pub fn train<F>(
        &self,
        data: &EnsembleDataset<'_>,
        factory: &F,
        config: &TrainConfig,
        store: &ArtifactStore,
    ) -> Result<EnsembleRun<F::Model>>
    where
        F: ModelFactory,
        F::Model: Serialize,
    {
        config.validate().stage(Stage::Ensemble)?;
        store.invalidate().stage(Stage::Persist)?;
        let start = Instant::now();
        let total = self.n_folds;
        let folds = make_folds(data.records, total, |r| r.prop.clone(), self.seed).stage(Stage::Split)?;
        let prepared = PreparedData::from_records(data.records, data.layout, data.group, Some(data.scalers))
            .stage(Stage::Prepare)?;

        info!(
            group = %data.group.name,
            n_folds = total,
            n_records = prepared.len(),
            parallel = self.parallel,
            "training ensemble"
        );
        store.remove_dir(STAGING_DIR).stage(Stage::Persist)?;

        let results = if self.parallel {
            self.run_parallel(&folds, &prepared, factory, config, store)
        } else {
            (0..total)
                .map(|i| self.run_fold(i, &folds, &prepared, factory, config, store))
                .collect::<Result<Vec<_>>>()
        };
        let results = match results {
            Ok(results) => results,
            Err(err) => {
                if let Err(cleanup) = store.remove_dir(STAGING_DIR) {
                    warn!(error = %cleanup, "could not remove staging directory");
                }
                return Err(err);
            }
        };

        let mut oof = Vec::with_capacity(prepared.len());
        let mut members = Vec::with_capacity(total);
        let mut outcomes = Vec::with_capacity(total);
        for result in results {
            for (index, prediction) in result.oof {
                let record = &data.records[index];
                oof.push(OofPrediction {
                    index,
                    smiles: record.smiles.clone(),
                    prop: record.prop.clone(),
                    fold: result.fold_idx,
                    target: prepared.y[index],
                    prediction,
                });
            }
            members.push(result.model);
            outcomes.push(result.outcome);
        }
        oof.sort_by_key(|p| p.index);

        let fold_scores = outcomes.iter().map(|o| o.best_val_rmse).collect();
        let manifest = EnsembleManifest::new(data.group.clone(), data.layout.clone(), fold_scores);
        self.persist(store, data.scalers, config, &oof, &manifest)
            .stage(Stage::Persist)?;

        info!(
            group = %data.group.name,
            path = %store.root().display(),
            elapsed_secs = start.elapsed().as_secs_f64(),
            "ensemble saved"
        );

        Ok(EnsembleRun {
            members,
            outcomes,
            folds,
            oof,
            manifest,
        })
    }

    fn run_parallel<F>(
        &self,
        folds: &FoldAssignment,
        prepared: &PreparedData,
        factory: &F,
        config: &TrainConfig,
        store: &ArtifactStore,
    ) -> Result<Vec<FoldResult<F::Model>>>
    where
        F: ModelFactory,
        F::Model: Serialize,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.device.threads.min(self.n_folds).max(1))
            .build()
            .map_err(|e| MolPropError::ConfigError(format!("could not start fold workers: {}", e)))?;
        let results: Vec<Result<FoldResult<F::Model>>> = pool.install(|| {
            (0..self.n_folds)
                .into_par_iter()
                .map(|i| self.run_fold(i, folds, prepared, factory, config, store))
                .collect()
        });
        results.into_iter().collect()
    }

    fn run_fold<F>(
        &self,
        fold_idx: usize,
        folds: &FoldAssignment,
        prepared: &PreparedData,
        factory: &F,
        config: &TrainConfig,
        store: &ArtifactStore,
    ) -> Result<FoldResult<F::Model>>
    where
        F: ModelFactory,
        F::Model: Serialize,
    {
        let stage = Stage::Fold {
            index: fold_idx,
            total: self.n_folds,
        };
        let split = folds.split(fold_idx);
        let train = prepared.select(&split.train_indices);
        let val = prepared.select(&split.val_indices);

        let seed = self.fold_seed(fold_idx);
        let mut model = factory.build(seed);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed ^ SHUFFLE_STREAM);
        let outcome = self
            .trainer
            .train(&mut model, &train, &val, config, &mut rng)
            .stage(stage)?;

        let dir = ArtifactStore::fold_dir(STAGING_DIR, fold_idx);
        store.write_json(dir.join(MODEL_FILE), &model).stage(stage)?;
        store
            .write_hyperparams(dir.join(HYPERPARAMS_FILE), &config.hps)
            .stage(stage)?;

        info!(
            fold = fold_idx + 1,
            total = self.n_folds,
            n_train = train.len(),
            n_val = val.len(),
            best_val_rmse = outcome.best_val_rmse,
            best_epoch = outcome.best_epoch,
            "fold trained"
        );

        let predictions = model.predict(&val.x);
        let oof = split
            .val_indices
            .iter()
            .copied()
            .zip(predictions.iter().copied())
            .collect();
        Ok(FoldResult {
            fold_idx,
            model,
            outcome,
            oof,
        })
    }

    fn persist(
        &self,
        store: &ArtifactStore,
        scalers: &ScalerDict,
        config: &TrainConfig,
        oof: &[OofPrediction],
        manifest: &EnsembleManifest,
    ) -> Result<()> {
        store.write_scalers(scalers)?;
        store.write_hyperparams(HYPERPARAMS_FILE, &config.hps)?;
        store.promote_staging()?;
        store.write_oof(oof)?;
        store.write_manifest(manifest)?;
        Ok(())
    }
}

/// Train and persist a `k`-fold ensemble with folds from `make_folds(records, k, seed)`
pub fn train_kfold_ensemble<F>(
    data: &EnsembleDataset<'_>,
    factory: &F,
    config: &TrainConfig,
    k: usize,
    seed: u64,
    store: &ArtifactStore,
) -> Result<EnsembleRun<F::Model>>
where
    F: ModelFactory,
    F::Model: Serialize,
{
    EnsembleTrainer::new(k, seed).train(data, factory, config, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparams::Hyperparameters;
    use crate::model::{Activation, MlpFactory};
    use crate::preprocessing::ScalerType;
    use crate::training::persistence::{MANIFEST_FILE, MODELS_DIR};
    use ndarray::{Array1, Array2};
    use rand::RngCore;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn hps() -> Hyperparameters {
        Hyperparameters {
            r_learn: 5e-3,
            batch_size: 8,
            dropout_pct: 0.0,
            capacity: 1,
            activation: Activation::LeakyReLU,
        }
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut r = Record::new(format!("C{}", i), "Tg", i as f64 * 0.5);
                r.attach_features(Arc::from(vec![(i % 2) as f64, (i % 3) as f64, i as f64 / n as f64]));
                r
            })
            .collect()
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Flaky {
        diverge: bool,
    }

    impl Regressor for Flaky {
        fn input_dim(&self) -> usize {
            3
        }

        fn train_step(&mut self, _x: &Array2<f64>, _y: &Array1<f64>, _lr: f64, _rng: &mut dyn RngCore) -> f64 {
            if self.diverge {
                f64::INFINITY
            } else {
                1.0
            }
        }

        fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
            Array1::zeros(x.nrows())
        }
    }

    struct FlakyFactory {
        bad_seed: u64,
    }

    impl ModelFactory for FlakyFactory {
        type Model = Flaky;

        fn build(&self, seed: u64) -> Flaky {
            Flaky {
                diverge: seed == self.bad_seed,
            }
        }
    }

    #[test]
    fn test_every_record_gets_one_oof_prediction() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let records = records(30);
        let group = PropertyGroup::new("tg", ["Tg"]);
        let layout = FeatureLayout::from_records(3, &records, &group);
        let scalers = ScalerDict::fit(&records, ScalerType::Standard).unwrap();
        let data = EnsembleDataset {
            records: &records,
            layout: &layout,
            group: &group,
            scalers: &scalers,
        };
        let config = TrainConfig::new(hps(), 3);
        let run = train_kfold_ensemble(&data, &MlpFactory::new(3, hps()), &config, 3, 100, &store).unwrap();

        assert_eq!(run.members.len(), 3);
        assert_eq!(run.oof.len(), 30);
        assert!(run.oof.iter().enumerate().all(|(i, p)| p.index == i));
        assert_eq!(store.count_fold_dirs(MODELS_DIR).unwrap(), 3);
        assert!(store.exists(MANIFEST_FILE));
        assert!(!store.exists(STAGING_DIR));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let records = records(24);
        let group = PropertyGroup::new("tg", ["Tg"]);
        let layout = FeatureLayout::from_records(3, &records, &group);
        let scalers = ScalerDict::fit(&records, ScalerType::Standard).unwrap();
        let data = EnsembleDataset {
            records: &records,
            layout: &layout,
            group: &group,
            scalers: &scalers,
        };
        let config = TrainConfig::new(hps(), 2);
        let factory = MlpFactory::new(3, hps());

        let scores = |parallel: bool| {
            let dir = TempDir::new().unwrap();
            let store = ArtifactStore::create(dir.path()).unwrap();
            EnsembleTrainer::new(3, 7)
                .with_parallel(parallel)
                .train(&data, &factory, &config, &store)
                .unwrap()
                .fold_scores()
                .to_vec()
        };
        assert_eq!(scores(false), scores(true));
    }

    #[test]
    fn test_failed_fold_aborts_without_manifest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let records = records(12);
        let group = PropertyGroup::new("tg", ["Tg"]);
        let layout = FeatureLayout::from_records(3, &records, &group);
        let scalers = ScalerDict::fit(&records, ScalerType::Standard).unwrap();
        let data = EnsembleDataset {
            records: &records,
            layout: &layout,
            group: &group,
            scalers: &scalers,
        };
        let trainer = EnsembleTrainer::new(3, 1);
        let factory = FlakyFactory {
            bad_seed: trainer.fold_seed(1),
        };

        let err = trainer
            .train(&data, &factory, &TrainConfig::new(hps(), 2), &store)
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Fold { index: 1, total: 3 }));
        assert!(err.to_string().starts_with("fold 2 of 3 failed"));
        assert!(matches!(err.root_cause(), MolPropError::TrainingDiverged { .. }));
        assert!(!store.exists(MANIFEST_FILE));
        assert!(!store.exists(STAGING_DIR));
        assert!(!store.exists(MODELS_DIR));
    }

    #[test]
    fn test_failed_retrain_leaves_no_manifest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let records = records(12);
        let group = PropertyGroup::new("tg", ["Tg"]);
        let layout = FeatureLayout::from_records(3, &records, &group);
        let scalers = ScalerDict::fit(&records, ScalerType::Standard).unwrap();
        let data = EnsembleDataset {
            records: &records,
            layout: &layout,
            group: &group,
            scalers: &scalers,
        };
        let trainer = EnsembleTrainer::new(3, 1);
        let config = TrainConfig::new(hps(), 2);
        trainer.train(&data, &MlpFactory::new(3, hps()), &config, &store).unwrap();
        assert!(store.exists(MANIFEST_FILE));

        let factory = FlakyFactory {
            bad_seed: trainer.fold_seed(2),
        };
        let err = trainer.train(&data, &factory, &config, &store).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Fold { index: 2, total: 3 }));
        assert!(!store.exists(MANIFEST_FILE));
        assert!(!store.exists(STAGING_DIR));
    }

    #[test]
    fn test_invalid_config_is_attributed_to_ensemble() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let records = records(12);
        let group = PropertyGroup::new("tg", ["Tg"]);
        let layout = FeatureLayout::from_records(3, &records, &group);
        let scalers = ScalerDict::fit(&records, ScalerType::Standard).unwrap();
        let data = EnsembleDataset {
            records: &records,
            layout: &layout,
            group: &group,
            scalers: &scalers,
        };
        let err = EnsembleTrainer::new(3, 1)
            .train(&data, &MlpFactory::new(3, hps()), &TrainConfig::new(hps(), 0), &store)
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Ensemble));
        assert!(matches!(err.root_cause(), MolPropError::ConfigError(_)));
    }
}
