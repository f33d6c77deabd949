//! End-to-end training run
//!
//! Per configured property group: featurize, fit scalers, search
//! hyperparameters with a cheap proxy model, train the k-fold ensemble, reload
//! it from disk and score it on the held-out records.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::data::{split, split_indices, FeatureLayout, PreparedData, PropertyGroup, Record};
use crate::device::Device;
use crate::error::{MolPropError, Result, Stage, StageContext};
use crate::featurize::{featurize_records, FeatureEncoder};
use crate::hyperparams::Hyperparameters;
use crate::inference::{eval_ensemble, Ensemble, EnsemblePrediction};
use crate::metrics::MetricsReport;
use crate::model::{MlpFactory, MlpOut, ModelFactory};
use crate::optimizer::{BayesianSearch, SearchResult};
use crate::preprocessing::ScalerDict;
use crate::training::{
    ArtifactStore, EnsembleDataset, EnsembleTrainer, MinibatchTrainer, SubmodelTrainer, TrainConfig,
};

/// Outcome of one property group
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group: String,
    pub n_train: usize,
    pub n_test: usize,
    /// Training records removed by featurization
    pub n_dropped: usize,
    pub best_hps: Hyperparameters,
    pub search: SearchResult,
    pub fold_scores: Vec<f64>,
    pub prediction: EnsemblePrediction,
    pub metrics: MetricsReport,
    pub artifacts: PathBuf,
}

/// Training pipeline over every configured property group
pub struct Pipeline<E> {
    config: PipelineConfig,
    encoder: E,
    output_dir: PathBuf,
    device: Device,
}

impl<E: FeatureEncoder + Serialize> Pipeline<E> {
    pub fn new(config: PipelineConfig, encoder: E, output_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let device = Device::resolve(config.device);
        Ok(Self {
            config,
            encoder,
            output_dir: output_dir.into(),
            device,
        })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run every group; the first failing group aborts the run
    pub fn run(&self, records: Vec<Record>) -> Result<Vec<GroupReport>> {
        let start = Instant::now();
        if records.is_empty() {
            return Err(MolPropError::InsufficientData("the dataset is empty".to_string())).stage(Stage::Load);
        }

        let (train, test) = split(
            &records,
            self.config.test_fraction,
            |r: &Record| r.prop.clone(),
            self.config.random_seed,
        )
        .stage(Stage::Split)?;
        info!(n_train = train.len(), n_test = test.len(), "split dataset");

        let mut reports = Vec::new();
        for group in self.config.groups() {
            let group_train: Vec<Record> = train.iter().filter(|r| group.contains(r)).cloned().collect();
            let group_test: Vec<Record> = test.iter().filter(|r| group.contains(r)).cloned().collect();
            if group_train.is_empty() {
                warn!(group = %group.name, "no records for group, skipping");
                continue;
            }
            reports.push(self.run_group(&group, group_train, group_test)?);
        }

        if reports.is_empty() {
            return Err(MolPropError::DataError(
                "no records belong to any configured property group".to_string(),
            ))
            .stage(Stage::Prepare);
        }
        info!(
            groups = reports.len(),
            elapsed_secs = start.elapsed().as_secs_f64(),
            "pipeline finished"
        );
        Ok(reports)
    }

    fn run_group(&self, group: &PropertyGroup, train: Vec<Record>, test: Vec<Record>) -> Result<GroupReport> {
        let config = &self.config;
        info!(group = %group.name, n_train = train.len(), n_test = test.len(), "training group");

        let store = ArtifactStore::create(self.output_dir.join(&group.name)).stage(Stage::Persist)?;
        store.invalidate().stage(Stage::Persist)?;

        let layout = FeatureLayout::from_records(self.encoder.n_features(), &train, group);
        let featurized = featurize_records(train, &self.encoder, &layout, config.featurization_policy())
            .stage(Stage::Featurization)?;
        let n_dropped = featurized.dropped.len();
        let train = featurized.records;

        let scalers = ScalerDict::fit(&train, config.scaler).stage(Stage::Prepare)?;
        info!(group = %group.name, scalers = %scalers, "fitted scalers");
        store.write_features(&layout, &self.encoder).stage(Stage::Persist)?;
        store.write_scalers(&scalers).stage(Stage::Persist)?;

        let search = self.search(group, &train, &layout, &scalers).stage(Stage::Search)?;
        store.write_trial_log(&search).stage(Stage::Persist)?;
        let best_hps = config.hyperparameters(&search.best_params).stage(Stage::Search)?;
        info!(
            group = %group.name,
            hps = %best_hps,
            score = search.best_score,
            trial = search.best_index,
            "selected hyperparameters"
        );

        let data = EnsembleDataset {
            records: &train,
            layout: &layout,
            group,
            scalers: &scalers,
        };
        let train_config =
            TrainConfig::for_group(best_hps, config.submodel_epochs, group).with_device(self.device);
        let run = EnsembleTrainer::new(config.n_folds, config.random_seed)
            .with_parallel(config.parallel_folds)
            .train(&data, &MlpFactory::new(layout.input_dim(), best_hps), &train_config, &store)
            .stage(Stage::Ensemble)?;

        let ensemble = Ensemble::<MlpOut>::load(store.root()).stage(Stage::Inference)?;
        let prediction = eval_ensemble(&ensemble, &test, &self.encoder, &config.ensemble_options())
            .stage(Stage::Inference)?;
        let metrics = MetricsReport::from_prediction(&prediction).stage(Stage::Inference)?;
        metrics.log(&group.name);

        Ok(GroupReport {
            group: group.name.clone(),
            n_train: train.len(),
            n_test: prediction.len(),
            n_dropped,
            best_hps,
            search,
            fold_scores: run.fold_scores().to_vec(),
            prediction,
            metrics,
            artifacts: store.root().to_path_buf(),
        })
    }

    /// Bayesian search scored by proxy models on a fit/validation split
    fn search(
        &self,
        group: &PropertyGroup,
        train: &[Record],
        layout: &FeatureLayout,
        scalers: &ScalerDict,
    ) -> Result<SearchResult> {
        let config = &self.config;
        let keys: Vec<&str> = train.iter().map(|r| r.prop.as_str()).collect();
        let indices = split_indices(&keys, config.hp_val_fraction, config.random_seed).stage(Stage::Split)?;
        let prepared = PreparedData::from_records(train, layout, group, Some(scalers)).stage(Stage::Prepare)?;
        let fit = prepared.select(&indices.train);
        let val = prepared.select(&indices.test);
        info!(group = %group.name, n_fit = fit.len(), n_val = val.len(), "searching hyperparameters");

        let trainer = MinibatchTrainer::new();
        let mut search = BayesianSearch::new(config.search_space(), config.search_config())?;
        search.minimize(|params| {
            let hps = config.hyperparameters(params)?;
            let proxy = TrainConfig::for_group(hps, config.hp_epochs, group).with_device(self.device);
            let mut model = MlpFactory::new(layout.input_dim(), hps).build(config.random_seed);
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.random_seed);
            trainer
                .train(&mut model, &fit, &val, &proxy, &mut rng)
                .map(|outcome| outcome.best_val_rmse)
        })
    }
}
