//! molprop CLI Module
//!
//! Command-line interface for training ensembles, predicting with a trained
//! group and inspecting datasets.

use clap::{Args, Parser, Subcommand};
use colored::*;
use polars::prelude::*;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::data::{count_by_property, DatasetLoader, Record};
use crate::device::{Device, DeviceChoice};
use crate::error::{MolPropError, Result, Stage, StageContext};
use crate::featurize::HashedFingerprint;
use crate::inference::{eval_ensemble, Ensemble, EnsembleOptions, PredictionScale};
use crate::metrics::{MetricsReport, PropertyMetrics};
use crate::model::MlpOut;
use crate::pipeline::{GroupReport, Pipeline};
use crate::training::{ArtifactStore, FeatureArtifact};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn kv(key: &str, val: &str) {
    println!("  {:<18} {}", muted(key), val.white());
}

fn step_ok(msg: &str) {
    println!("  {} {}", ok("✓"), msg);
}

fn step_run(msg: &str) {
    println!("  {} {}...", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("    {} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

/// Print a failure as `error: <stage> failed: <cause>`
pub fn report_error(err: &anyhow::Error) {
    eprintln!("{} {}", "error:".red().bold(), err);
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "molprop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Uncertainty-aware ensembles for molecular property prediction")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search hyperparameters and train a k-fold ensemble per property group
    Train(TrainArgs),

    /// Predict with a trained property group
    Predict(PredictArgs),

    /// Show row counts per property
    Info {
        /// Input CSV file
        #[arg(short, long)]
        data: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Input CSV with smiles, prop and value columns
    #[arg(short, long)]
    pub data: PathBuf,

    /// Directory receiving one subdirectory per property group
    #[arg(short, long)]
    pub output: PathBuf,

    /// Compute device
    #[arg(long, value_enum)]
    pub device: Option<DeviceChoice>,

    /// JSON pipeline config
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of ensemble folds
    #[arg(long)]
    pub folds: Option<usize>,

    /// Hyperparameter search budget
    #[arg(long)]
    pub hp_calls: Option<usize>,

    /// Keep dropout active when evaluating the ensemble
    #[arg(long)]
    pub monte_carlo: bool,

    /// Train folds concurrently
    #[arg(long)]
    pub parallel_folds: bool,

    /// Fail on the first unparseable molecule instead of dropping it
    #[arg(long)]
    pub strict: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    /// Directory passed as --output to `train`
    #[arg(short, long)]
    pub models: PathBuf,

    /// Property group to load
    #[arg(short, long)]
    pub group: String,

    /// Input CSV; the value column is optional
    #[arg(short, long)]
    pub data: PathBuf,

    /// Output CSV with mean and std per row
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub monte_carlo: bool,

    /// Report values in original units instead of scaled units
    #[arg(long)]
    pub original_scale: bool,

    #[arg(long, value_enum, default_value = "cpu")]
    pub device: DeviceChoice,
}

impl TrainArgs {
    /// File config (or defaults) with the flags applied on top
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(device) = self.device {
            config = config.with_device(device);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if let Some(folds) = self.folds {
            config = config.with_folds(folds);
        }
        if let Some(calls) = self.hp_calls {
            config = config.with_hp_calls(calls);
        }
        if self.monte_carlo {
            config = config.with_monte_carlo(true);
        }
        if self.parallel_folds {
            config = config.with_parallel_folds(true);
        }
        if self.strict {
            config = config.with_strict_featurization(true);
        }
        config.validate()?;
        Ok(config)
    }
}

// ─── Commands ──────────────────────────────────────────────────────────────────

fn load(path: &PathBuf, loader: DatasetLoader) -> anyhow::Result<Vec<Record>> {
    step_run(&format!("Loading {}", path.display()));
    let start = Instant::now();
    let records = loader.load_csv(path).stage(Stage::Load)?;
    step_done(&format!("{} rows in {:?}", records.len(), start.elapsed()));
    Ok(records)
}

fn print_metrics(label: &str, metrics: &PropertyMetrics) {
    kv(
        label,
        &format!(
            "n={}  rmse={:.4}  mae={:.4}  r2={:.3}  cov1σ={:.2}  mean_std={:.4}",
            metrics.regression.n,
            metrics.regression.rmse,
            metrics.regression.mae,
            metrics.regression.r2,
            metrics.uncertainty.coverage_1sigma,
            metrics.uncertainty.mean_std
        ),
    );
}

fn print_report(report: &GroupReport) {
    section(&format!("Group {}", report.group));
    kv("Records", &format!("{} train / {} test", report.n_train, report.n_test));
    if report.n_dropped > 0 {
        kv("Dropped", &format!("{} unparseable", report.n_dropped).yellow().to_string());
    }
    kv("Hyperparameters", &report.best_hps.to_string());
    kv(
        "Search",
        &format!(
            "best {:.4} at trial {} of {} ({} diverged)",
            report.search.best_score,
            report.search.best_index + 1,
            report.search.trials.len(),
            report.search.n_diverged()
        ),
    );
    let folds: Vec<String> = report.fold_scores.iter().map(|s| format!("{:.4}", s)).collect();
    kv("Fold val RMSE", &folds.join("  "));
    for (prop, metrics) in &report.metrics.by_property {
        print_metrics(prop, metrics);
    }
    if report.metrics.by_property.len() > 1 {
        print_metrics("overall", &report.metrics.overall);
    }
    kv("Scale", &format!("{:?}", report.prediction.scale).to_lowercase());
    kv("Artifacts", &report.artifacts.display().to_string());
}

pub fn cmd_train(args: &TrainArgs) -> anyhow::Result<()> {
    section("Train");
    let config = args.pipeline_config()?;
    let records = load(&args.data, DatasetLoader::new())?;

    step_run(&format!(
        "Training {} group(s), {} folds, {} search trials",
        config.property_groups.len(),
        config.n_folds,
        config.hp_ncalls
    ));
    let start = Instant::now();
    let encoder = config.encoder();
    let pipeline = Pipeline::new(config, encoder, &args.output)?;
    let reports = pipeline.run(records)?;
    step_done(&format!("{:?}", start.elapsed()));

    for report in &reports {
        print_report(report);
    }
    println!();
    step_ok(&format!("Artifacts written to {}", args.output.display()));
    println!();
    Ok(())
}

pub fn cmd_predict(args: &PredictArgs) -> anyhow::Result<()> {
    section("Predict");
    let device = Device::resolve(args.device);

    step_run(&format!("Loading group {}", args.group.cyan()));
    let store = ArtifactStore::new(args.models.join(&args.group));
    let features: FeatureArtifact<HashedFingerprint> = store.read_features().stage(Stage::Load)?;
    let ensemble = Ensemble::<MlpOut>::load(store.root()).stage(Stage::Load)?;
    if &features.layout != ensemble.layout() {
        return Err(MolPropError::persistence(
            store.path(crate::training::persistence::FEATURES_FILE),
            "feature layout does not match the ensemble manifest",
        )
        .at_stage(Stage::Load)
        .into());
    }
    step_done(&format!("{} members on {}", ensemble.len(), device));

    let records = load(&args.data, DatasetLoader::new().with_optional_targets())?;
    let records: Vec<Record> = records
        .into_iter()
        .filter(|r| ensemble.group().contains(r))
        .collect();

    let mut options = EnsembleOptions::new().with_scale(if args.original_scale {
        PredictionScale::Original
    } else {
        PredictionScale::Scaled
    });
    if args.monte_carlo {
        options = options.with_monte_carlo(options.mc_passes);
    }

    step_run(&format!("Predicting {} records", records.len()));
    let prediction = eval_ensemble(&ensemble, &records, &features.encoder, &options).stage(Stage::Inference)?;
    step_done(&format!(
        "{} predictions per row, {} dropped",
        prediction.n_predictions,
        prediction.dropped.len()
    ));

    if prediction.targets.iter().any(|t| t.is_finite()) {
        let metrics = MetricsReport::from_prediction(&prediction)?;
        metrics.log(&args.group);
        section("Metrics");
        for (prop, m) in &metrics.by_property {
            print_metrics(prop, m);
        }
    }

    match &args.output {
        Some(path) => {
            let mut df = prediction.to_dataframe()?;
            let mut file = std::fs::File::create(path)?;
            CsvWriter::new(&mut file).finish(&mut df)?;
            step_ok(&format!("Predictions written to {}", path.display()));
        }
        None => {
            section("Predictions");
            for i in 0..prediction.len().min(10) {
                println!(
                    "  {:<32} {:<8} {:>10.4} ± {:.4}",
                    prediction.smiles[i], prediction.selectors[i], prediction.mean[i], prediction.std[i]
                );
            }
            if prediction.len() > 10 {
                println!("  {}", dim(&format!("... {} more", prediction.len() - 10)));
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_info(data_path: &PathBuf) -> anyhow::Result<()> {
    section("Dataset");
    let records = load(data_path, DatasetLoader::new().with_optional_targets())?;
    let counts = count_by_property(&records);
    for (prop, count) in &counts {
        kv(prop, &count.to_string());
    }
    let unique = records
        .iter()
        .map(|r| r.smiles.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    kv("molecules", &unique.to_string());
    kv("rows", &records.len().to_string());
    println!();
    Ok(())
}
