//! On-disk artifacts of a trained property group
//!
//! Every JSON file is written to a temporary sibling first and renamed into
//! place. `manifest.json` is written last and marks a complete ensemble.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{FeatureLayout, PropertyGroup};
use crate::error::{MolPropError, Result};
use crate::hyperparams::Hyperparameters;
use crate::optimizer::SearchResult;
use crate::preprocessing::ScalerDict;

pub const SCALERS_FILE: &str = "scalers.json";
pub const FEATURES_FILE: &str = "features.json";
pub const HYPERPARAMS_FILE: &str = "hyperparams.json";
pub const TRIAL_LOG_FILE: &str = "trial_log.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const OOF_FILE: &str = "oof_predictions.json";
pub const MODEL_FILE: &str = "model.json";
pub const MODELS_DIR: &str = "models";
pub const STAGING_DIR: &str = "models.staging";

/// Marks a fully written ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleManifest {
    pub group: PropertyGroup,
    pub n_folds: usize,
    /// Best validation RMSE of each fold, by fold index
    pub fold_scores: Vec<f64>,
    pub input_dim: usize,
    pub layout: FeatureLayout,
    pub created_at: DateTime<Utc>,
    pub version: String,
}

impl EnsembleManifest {
    pub fn new(group: PropertyGroup, layout: FeatureLayout, fold_scores: Vec<f64>) -> Self {
        Self {
            n_folds: fold_scores.len(),
            input_dim: layout.input_dim(),
            group,
            fold_scores,
            layout,
            created_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Encoder parameters stored next to the layout they produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureArtifact<E> {
    pub layout: FeatureLayout,
    pub encoder: E,
}

/// Out-of-fold prediction of one training record, in scaled units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OofPrediction {
    /// Position in the ensemble's training records
    pub index: usize,
    pub smiles: String,
    pub prop: String,
    pub fold: usize,
    pub target: f64,
    pub prediction: f64,
}

/// Directory holding the artifacts of one property group
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open an existing or future directory without touching the filesystem
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open `root`, creating it if needed
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root).map_err(|e| MolPropError::persistence(&store.root, e))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        self.path(relative).exists()
    }

    pub fn fold_dir(dir: &str, fold_idx: usize) -> PathBuf {
        Path::new(dir).join(format!("fold_{}", fold_idx))
    }

    /// Serialize `value` as pretty JSON through a temporary file
    pub fn write_json<T: Serialize + ?Sized>(&self, relative: impl AsRef<Path>, value: &T) -> Result<PathBuf> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MolPropError::persistence(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| MolPropError::persistence(&path, e))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| MolPropError::persistence(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| MolPropError::persistence(&path, e))?;
        debug!(path = %path.display(), "wrote artifact");
        Ok(path)
    }

    pub fn read_json<T: DeserializeOwned>(&self, relative: impl AsRef<Path>) -> Result<T> {
        let path = self.path(relative);
        let bytes = fs::read(&path).map_err(|e| MolPropError::persistence(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| MolPropError::persistence(&path, e))
    }

    pub fn write_scalers(&self, scalers: &ScalerDict) -> Result<PathBuf> {
        self.write_json(SCALERS_FILE, scalers)
    }

    pub fn read_scalers(&self) -> Result<ScalerDict> {
        self.read_json(SCALERS_FILE)
    }

    pub fn write_features<E: Serialize>(&self, layout: &FeatureLayout, encoder: &E) -> Result<PathBuf> {
        self.write_json(
            FEATURES_FILE,
            &FeatureArtifact {
                layout: layout.clone(),
                encoder,
            },
        )
    }

    pub fn read_features<E: DeserializeOwned>(&self) -> Result<FeatureArtifact<E>> {
        self.read_json(FEATURES_FILE)
    }

    pub fn write_hyperparams(&self, relative: impl AsRef<Path>, hps: &Hyperparameters) -> Result<PathBuf> {
        self.write_json(relative, hps)
    }

    /// Read and re-validate a hyperparameter file
    pub fn read_hyperparams(&self, relative: impl AsRef<Path>) -> Result<Hyperparameters> {
        let hps: Hyperparameters = self.read_json(relative)?;
        hps.validate()?;
        Ok(hps)
    }

    pub fn write_trial_log(&self, search: &SearchResult) -> Result<PathBuf> {
        self.write_json(TRIAL_LOG_FILE, search)
    }

    pub fn read_trial_log(&self) -> Result<SearchResult> {
        self.read_json(TRIAL_LOG_FILE)
    }

    pub fn write_oof(&self, oof: &[OofPrediction]) -> Result<PathBuf> {
        self.write_json(OOF_FILE, oof)
    }

    pub fn write_manifest(&self, manifest: &EnsembleManifest) -> Result<PathBuf> {
        self.write_json(MANIFEST_FILE, manifest)
    }

    pub fn read_manifest(&self) -> Result<EnsembleManifest> {
        if !self.exists(MANIFEST_FILE) {
            return Err(MolPropError::persistence(
                self.path(MANIFEST_FILE),
                "no manifest, the ensemble is missing or incomplete",
            ));
        }
        self.read_json(MANIFEST_FILE)
    }

    /// Remove the manifest so the directory no longer reads as complete
    pub fn invalidate(&self) -> Result<()> {
        let path = self.path(MANIFEST_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MolPropError::persistence(&path, e)),
        }
    }

    pub fn remove_dir(&self, relative: impl AsRef<Path>) -> Result<()> {
        let path = self.path(relative);
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| MolPropError::persistence(&path, e))?;
        }
        Ok(())
    }

    /// Replace `models/` with the staging directory
    pub fn promote_staging(&self) -> Result<()> {
        self.invalidate()?;
        self.remove_dir(MODELS_DIR)?;
        let from = self.path(STAGING_DIR);
        let to = self.path(MODELS_DIR);
        fs::rename(&from, &to).map_err(|e| MolPropError::persistence(&to, e))
    }

    /// Number of `fold_*` directories under `dir`
    pub fn count_fold_dirs(&self, dir: &str) -> Result<usize> {
        let path = self.path(dir);
        let entries = fs::read_dir(&path).map_err(|e| MolPropError::persistence(&path, e))?;
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| MolPropError::persistence(&path, e))?;
            let is_fold = entry.file_name().to_string_lossy().starts_with("fold_");
            if is_fold && entry.path().is_dir() {
                count += 1;
            }
        }
        Ok(count)
    }
}
