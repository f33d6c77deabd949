//! Molecule featurization
//!
//! A [`FeatureEncoder`] turns a molecule identifier into a fixed-length
//! vector. [`featurize_records`] encodes every distinct identifier once,
//! appends the record's graph features in layout order and caches the result
//! on the record.

mod fingerprint;
pub mod smiles;

pub use fingerprint::HashedFingerprint;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::{FeatureLayout, Record};
use crate::error::{MolPropError, Result};

/// Maps a molecule identifier to a fixed-length feature vector
pub trait FeatureEncoder: Send + Sync {
    /// Length of every encoded vector
    fn n_features(&self) -> usize;

    fn encode(&self, identifier: &str) -> Result<Vec<f64>>;
}

/// What to do with a record whose identifier cannot be encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturizationPolicy {
    /// Drop the record and report it
    #[default]
    Drop,
    /// Fail on the first unencodable record
    Strict,
}

/// A record removed by [`FeaturizationPolicy::Drop`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRecord {
    /// Position in the input
    pub index: usize,
    pub smiles: String,
    pub prop: String,
    pub reason: String,
}

/// Featurized records plus the ones that were dropped
#[derive(Debug, Clone)]
pub struct FeaturizeOutcome {
    pub records: Vec<Record>,
    pub dropped: Vec<DroppedRecord>,
}

fn failure_reason(err: MolPropError) -> String {
    match err {
        MolPropError::FeaturizationError { reason, .. } => reason,
        other => other.to_string(),
    }
}

/// Attach features to every record that has none yet
pub fn featurize_records<E: FeatureEncoder + ?Sized>(
    records: Vec<Record>,
    encoder: &E,
    layout: &FeatureLayout,
    policy: FeaturizationPolicy,
) -> Result<FeaturizeOutcome> {
    if encoder.n_features() != layout.n_fingerprint {
        return Err(MolPropError::ShapeError {
            expected: format!("{} fingerprint features", layout.n_fingerprint),
            actual: format!("encoder produces {}", encoder.n_features()),
        });
    }

    let pending: BTreeSet<&str> = records
        .iter()
        .filter(|r| !r.is_featurized())
        .map(|r| r.smiles.as_str())
        .collect();
    let pending: Vec<&str> = pending.into_iter().collect();

    let encoded: BTreeMap<String, std::result::Result<Vec<f64>, String>> = pending
        .par_iter()
        .map(|&smiles| {
            let result = encoder.encode(smiles).and_then(|bits| {
                if bits.len() == layout.n_fingerprint {
                    Ok(bits)
                } else {
                    Err(MolPropError::ShapeError {
                        expected: format!("{} features", layout.n_fingerprint),
                        actual: format!("{} features", bits.len()),
                    })
                }
            });
            (smiles.to_string(), result.map_err(failure_reason))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect();
    debug!(unique = encoded.len(), "encoded identifiers");

    let mut kept = Vec::with_capacity(records.len());
    let mut dropped = Vec::new();
    for (index, mut record) in records.into_iter().enumerate() {
        if record.is_featurized() {
            kept.push(record);
            continue;
        }
        match encoded.get(&record.smiles) {
            Some(Ok(bits)) => {
                let mut features = Vec::with_capacity(layout.feature_dim());
                features.extend_from_slice(bits);
                features.extend(
                    layout
                        .graph_features
                        .iter()
                        .map(|name| record.graph_feats.get(name).copied().unwrap_or(0.0)),
                );
                record.attach_features(Arc::from(features));
                kept.push(record);
            }
            Some(Err(reason)) => match policy {
                FeaturizationPolicy::Strict => {
                    return Err(MolPropError::FeaturizationError {
                        identifier: record.smiles,
                        reason: reason.clone(),
                    })
                }
                FeaturizationPolicy::Drop => {
                    warn!(index, smiles = %record.smiles, %reason, "dropping record");
                    dropped.push(DroppedRecord {
                        index,
                        smiles: record.smiles,
                        prop: record.prop,
                        reason: reason.clone(),
                    });
                }
            },
            None => {
                return Err(MolPropError::DataError(format!(
                    "identifier '{}' was not encoded",
                    record.smiles
                )))
            }
        }
    }

    Ok(FeaturizeOutcome { records: kept, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PropertyGroup;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl FeatureEncoder for CountingEncoder {
        fn n_features(&self) -> usize {
            2
        }

        fn encode(&self, identifier: &str) -> Result<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if identifier == "bad" {
                return Err(MolPropError::FeaturizationError {
                    identifier: identifier.to_string(),
                    reason: "unparseable".to_string(),
                });
            }
            Ok(vec![identifier.len() as f64, 1.0])
        }
    }

    fn layout(records: &[Record]) -> FeatureLayout {
        FeatureLayout::from_records(2, records, &PropertyGroup::new("g", ["a"]))
    }

    #[test]
    fn test_each_identifier_encoded_once() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let records = vec![
            Record::new("CC", "a", 1.0),
            Record::new("CC", "a", 2.0),
            Record::new("CCC", "a", 3.0),
        ];
        let layout = layout(&records);
        let out = featurize_records(records, &encoder, &layout, FeaturizationPolicy::Strict).unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.records[2].features().unwrap(), &[3.0, 1.0]);
    }

    #[test]
    fn test_featurized_records_are_skipped() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let records = vec![Record::new("CC", "a", 1.0)];
        let layout = layout(&records);
        let first = featurize_records(records, &encoder, &layout, FeaturizationPolicy::Strict).unwrap();
        let second = featurize_records(first.records, &encoder, &layout, FeaturizationPolicy::Strict).unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
        assert!(second.records[0].is_featurized());
    }

    #[test]
    fn test_graph_features_follow_layout() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let mut feats = BTreeMap::new();
        feats.insert("mw".to_string(), 28.0);
        let records = vec![
            Record::new("CC", "a", 1.0).with_graph_feats(feats),
            Record::new("C", "a", 1.0),
        ];
        let layout = layout(&records);
        let out = featurize_records(records, &encoder, &layout, FeaturizationPolicy::Strict).unwrap();
        assert_eq!(out.records[0].features().unwrap(), &[2.0, 1.0, 28.0]);
        assert_eq!(out.records[1].features().unwrap(), &[1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_drop_policy_reports() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let records = vec![Record::new("CC", "a", 1.0), Record::new("bad", "a", 2.0)];
        let layout = layout(&records);
        let out = featurize_records(records, &encoder, &layout, FeaturizationPolicy::Drop).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.dropped.len(), 1);
        assert_eq!(out.dropped[0].index, 1);
    }

    #[test]
    fn test_strict_policy_fails() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let records = vec![Record::new("bad", "a", 2.0)];
        let layout = layout(&records);
        assert!(matches!(
            featurize_records(records, &encoder, &layout, FeaturizationPolicy::Strict),
            Err(MolPropError::FeaturizationError { .. })
        ));
    }

    #[test]
    fn test_fingerprint_end_to_end() {
        let encoder = HashedFingerprint::new(32);
        let records = vec![Record::new("[*]CC(C)[*]", "a", 1.0)];
        let layout = FeatureLayout::from_records(32, &records, &PropertyGroup::new("g", ["a"]));
        let out = featurize_records(records, &encoder, &layout, FeaturizationPolicy::Strict).unwrap();
        assert_eq!(out.records[0].features().unwrap().len(), 32);
    }

    #[test]
    fn test_oversized_bracket_atoms_are_dropped() {
        let encoder = HashedFingerprint::new(16);
        let records = vec![
            Record::new("CCO", "a", 1.0),
            Record::new("[C+2000000000+2000000000]", "a", 2.0),
            Record::new("[CH999]", "a", 3.0),
        ];
        let layout = FeatureLayout::from_records(16, &records, &PropertyGroup::new("g", ["a"]));
        let out = featurize_records(records, &encoder, &layout, FeaturizationPolicy::Drop).unwrap();
        assert_eq!(out.records.len(), 1);
        let dropped: Vec<usize> = out.dropped.iter().map(|d| d.index).collect();
        assert_eq!(dropped, vec![1, 2]);
    }
}
