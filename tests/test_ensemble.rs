//! Integration test: k-fold ensemble training, persistence and prediction

use ndarray::{Array1, Array2};
use rand::RngCore;
use tempfile::TempDir;

use molprop::data::{FeatureLayout, PropertyGroup, Record};
use molprop::error::MolPropError;
use molprop::featurize::{featurize_records, FeaturizationPolicy, HashedFingerprint};
use molprop::hyperparams::Hyperparameters;
use molprop::inference::{eval_ensemble, Ensemble, EnsembleOptions, PredictionScale};
use molprop::model::{Activation, MlpFactory, MlpOut, Regressor};
use molprop::preprocessing::{ScalerDict, ScalerType};
use molprop::training::persistence::{MANIFEST_FILE, MODEL_FILE, MODELS_DIR, OOF_FILE, SCALERS_FILE, STAGING_DIR};
use molprop::training::{train_kfold_ensemble, ArtifactStore, EnsembleDataset, TrainConfig};

const N_BITS: usize = 16;

const SUBSTITUENTS: [&str; 10] = ["", "O", "N", "F", "Cl", "C(=O)O", "c1ccccc1", "C#N", "S", "Br"];

fn smiles(i: usize) -> String {
    format!("{}{}", "C".repeat(1 + i % 10), SUBSTITUENTS[(i / 10) % 10])
}

fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::new(smiles(i), "Tg", 250.0 + 3.0 * (i % 10) as f64 + (i / 10) as f64))
        .collect()
}

fn hps() -> Hyperparameters {
    Hyperparameters {
        r_learn: 5e-3,
        batch_size: 8,
        dropout_pct: 0.1,
        capacity: 1,
        activation: Activation::LeakyReLU,
    }
}

fn group() -> PropertyGroup {
    PropertyGroup::new("tg", ["Tg"])
}

fn featurized(records: Vec<Record>, layout: &FeatureLayout) -> Vec<Record> {
    featurize_records(records, &HashedFingerprint::new(N_BITS), layout, FeaturizationPolicy::Strict)
        .unwrap()
        .records
}

/// Predicts the same value for every row
#[derive(Debug, Clone)]
struct Constant {
    value: f64,
}

impl Regressor for Constant {
    fn input_dim(&self) -> usize {
        N_BITS
    }

    fn train_step(&mut self, _x: &Array2<f64>, _y: &Array1<f64>, _lr: f64, _rng: &mut dyn RngCore) -> f64 {
        0.0
    }

    fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        Array1::from_elem(x.nrows(), self.value)
    }
}

fn constant_ensemble(values: &[f64], scaler: ScalerType) -> Ensemble<Constant> {
    let records = records(20);
    let layout = FeatureLayout::from_records(N_BITS, &records, &group());
    let scalers = ScalerDict::fit(&records, scaler).unwrap();
    let members = values.iter().map(|&value| Constant { value }).collect();
    Ensemble::new(members, hps(), scalers, layout, group()).unwrap()
}

#[test]
fn test_identical_members_have_zero_spread() {
    let ensemble = constant_ensemble(&[0.7, 0.7, 0.7], ScalerType::None);
    let prediction = eval_ensemble(&ensemble, &records(5), &HashedFingerprint::new(N_BITS), &EnsembleOptions::new()).unwrap();

    assert_eq!(prediction.len(), 5);
    assert_eq!(prediction.n_predictions, 3);
    assert!(prediction.mean.iter().all(|&m| (m - 0.7).abs() < 1e-12));
    assert!(prediction.std.iter().all(|&s| s == 0.0));
}

#[test]
fn test_disagreeing_members_have_positive_spread() {
    let ensemble = constant_ensemble(&[1.0, 2.0, 3.0], ScalerType::None);
    let prediction = eval_ensemble(&ensemble, &records(4), &HashedFingerprint::new(N_BITS), &EnsembleOptions::new()).unwrap();

    for (&mean, &std) in prediction.mean.iter().zip(&prediction.std) {
        assert!((mean - 2.0).abs() < 1e-12);
        assert!((std - 1.0).abs() < 1e-12);
    }
}

#[test]
fn test_single_member_reports_zero_spread() {
    let ensemble = constant_ensemble(&[4.0], ScalerType::None);
    let prediction = eval_ensemble(&ensemble, &records(3), &HashedFingerprint::new(N_BITS), &EnsembleOptions::new()).unwrap();
    assert!(prediction.std.iter().all(|&s| s == 0.0));
}

#[test]
fn test_original_scale_undoes_target_scaling() {
    let ensemble = constant_ensemble(&[-1.0, 1.0], ScalerType::Standard);
    let params = *ensemble.scalers().get("Tg").unwrap();
    let input = records(6);
    let options = EnsembleOptions::new().with_scale(PredictionScale::Original);
    let prediction = eval_ensemble(&ensemble, &input, &HashedFingerprint::new(N_BITS), &options).unwrap();

    assert_eq!(prediction.scale, PredictionScale::Original);
    for (i, record) in input.iter().enumerate() {
        assert!((prediction.mean[i] - params.center).abs() < 1e-9);
        assert!((prediction.std[i] - 2f64.sqrt() * params.scale).abs() < 1e-9);
        assert_eq!(prediction.targets[i], record.value);
    }

    let scaled = eval_ensemble(&ensemble, &input, &HashedFingerprint::new(N_BITS), &EnsembleOptions::new()).unwrap();
    assert!((scaled.targets[0] - params.transform(input[0].value)).abs() < 1e-12);
}

#[test]
fn test_unparseable_records_are_dropped_before_prediction() {
    let ensemble = constant_ensemble(&[0.0, 1.0], ScalerType::None);
    let mut input = records(3);
    input.insert(1, Record::new("C1CC", "Tg", 0.0));
    let prediction = eval_ensemble(&ensemble, &input, &HashedFingerprint::new(N_BITS), &EnsembleOptions::new()).unwrap();

    assert_eq!(prediction.len(), 3);
    assert_eq!(prediction.dropped.len(), 1);
    assert_eq!(prediction.dropped[0].index, 1);
}

#[test]
fn test_trained_ensemble_reloads_from_disk() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::create(dir.path()).unwrap();
    let group = group();
    let raw = records(60);
    let layout = FeatureLayout::from_records(N_BITS, &raw, &group);
    let train = featurized(raw, &layout);
    let scalers = ScalerDict::fit(&train, ScalerType::Standard).unwrap();
    let data = EnsembleDataset {
        records: &train,
        layout: &layout,
        group: &group,
        scalers: &scalers,
    };
    let config = TrainConfig::new(hps(), 5);

    let run = train_kfold_ensemble(&data, &MlpFactory::new(layout.input_dim(), hps()), &config, 3, 100, &store).unwrap();
    assert_eq!(run.members.len(), 3);
    assert_eq!(run.fold_scores().len(), 3);
    assert_eq!(run.oof.len(), train.len());

    assert_eq!(store.count_fold_dirs(MODELS_DIR).unwrap(), 3);
    assert!(store.exists(MANIFEST_FILE));
    assert!(store.exists(OOF_FILE));
    assert!(store.exists(SCALERS_FILE));
    assert!(!store.exists(STAGING_DIR));

    let manifest = store.read_manifest().unwrap();
    assert_eq!(manifest.n_folds, 3);
    assert_eq!(manifest.layout, layout);

    let loaded = Ensemble::<MlpOut>::load(dir.path()).unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.hyperparameters(), &hps());
    assert_eq!(loaded.scalers(), &scalers);

    let test: Vec<Record> = (60..70).map(|i| Record::new(smiles(i), "Tg", 260.0)).collect();
    let prediction = eval_ensemble(&loaded, &test, &HashedFingerprint::new(N_BITS), &EnsembleOptions::new()).unwrap();
    assert_eq!(prediction.len(), 10);
    assert!(prediction.mean.iter().all(|m| m.is_finite()));
    assert!(prediction.std.iter().all(|s| s.is_finite() && *s >= 0.0));

    let mc = EnsembleOptions::new().with_monte_carlo(4);
    let sampled = eval_ensemble(&loaded, &test, &HashedFingerprint::new(N_BITS), &mc).unwrap();
    assert_eq!(sampled.n_predictions, 12);
    let again = eval_ensemble(&loaded, &test, &HashedFingerprint::new(N_BITS), &mc).unwrap();
    assert_eq!(sampled.mean, again.mean);
}

#[test]
fn test_missing_manifest_is_a_persistence_error() {
    let dir = TempDir::new().unwrap();
    let err = Ensemble::<MlpOut>::load(dir.path()).unwrap_err();
    assert!(matches!(err, MolPropError::PersistenceError { .. }));
}

#[test]
fn test_member_count_must_match_manifest() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::create(dir.path()).unwrap();
    let group = group();
    let raw = records(30);
    let layout = FeatureLayout::from_records(N_BITS, &raw, &group);
    let train = featurized(raw, &layout);
    let scalers = ScalerDict::fit(&train, ScalerType::Standard).unwrap();
    let data = EnsembleDataset {
        records: &train,
        layout: &layout,
        group: &group,
        scalers: &scalers,
    };
    train_kfold_ensemble(&data, &MlpFactory::new(layout.input_dim(), hps()), &TrainConfig::new(hps(), 2), 3, 1, &store)
        .unwrap();

    std::fs::remove_dir_all(store.path(MODELS_DIR).join("fold_2")).unwrap();
    let err = Ensemble::<MlpOut>::load(dir.path()).unwrap_err();
    assert!(matches!(err, MolPropError::PersistenceError { .. }));
}

#[test]
fn test_inconsistent_member_weights_fail_to_load() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::create(dir.path()).unwrap();
    let group = group();
    let raw = records(30);
    let layout = FeatureLayout::from_records(N_BITS, &raw, &group);
    let train = featurized(raw, &layout);
    let scalers = ScalerDict::fit(&train, ScalerType::Standard).unwrap();
    let data = EnsembleDataset {
        records: &train,
        layout: &layout,
        group: &group,
        scalers: &scalers,
    };
    let deep = Hyperparameters { capacity: 2, ..hps() };
    train_kfold_ensemble(&data, &MlpFactory::new(layout.input_dim(), deep), &TrainConfig::new(deep, 2), 3, 1, &store)
        .unwrap();

    let path = store.path(MODELS_DIR).join("fold_0").join(MODEL_FILE);
    let mut model: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    model["weights"][1] = model["weights"][0].clone();
    std::fs::write(&path, serde_json::to_string(&model).unwrap()).unwrap();

    let err = Ensemble::<MlpOut>::load(dir.path()).unwrap_err();
    match err {
        MolPropError::PersistenceError { path, .. } => assert!(path.contains("fold_0"), "{}", path),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_monte_carlo_widens_spread_of_identical_members() {
    let train = records(20);
    let layout = FeatureLayout::from_records(N_BITS, &train, &group());
    let scalers = ScalerDict::fit(&train, ScalerType::None).unwrap();
    let noisy = Hyperparameters { dropout_pct: 0.3, ..hps() };
    let member = MlpOut::new(layout.input_dim(), noisy, 9);
    let ensemble = Ensemble::new(vec![member.clone(), member.clone(), member], noisy, scalers, layout, group()).unwrap();
    let input = records(12);
    let encoder = HashedFingerprint::new(N_BITS);

    let fixed = eval_ensemble(&ensemble, &input, &encoder, &EnsembleOptions::new()).unwrap();
    assert!(fixed.std.iter().all(|&s| s == 0.0));

    let sampled = eval_ensemble(&ensemble, &input, &encoder, &EnsembleOptions::new().with_monte_carlo(8)).unwrap();
    assert_eq!(sampled.n_predictions, 24);
    assert!(sampled.std.iter().all(|s| s.is_finite()));
    let widened = sampled.std.iter().filter(|&&s| s > 0.0).count();
    assert!(widened * 2 >= sampled.len(), "only {} of {} rows widened", widened, sampled.len());
    let mean_std = sampled.std.iter().sum::<f64>() / sampled.len() as f64;
    assert!(mean_std > 0.0);
}
