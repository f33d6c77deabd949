//! Labeled records, property groups and the model input layout

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One labeled observation of a property for a molecule
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Molecule identifier (SMILES)
    pub smiles: String,
    /// Property name
    pub prop: String,
    /// Property group named by the input row, if any
    pub group: Option<String>,
    /// Target value in the original scale
    pub value: f64,
    /// Precomputed graph-level features
    pub graph_feats: BTreeMap<String, f64>,
    features: Option<Arc<[f64]>>,
}

impl Record {
    pub fn new(smiles: impl Into<String>, prop: impl Into<String>, value: f64) -> Self {
        Self {
            smiles: smiles.into(),
            prop: prop.into(),
            group: None,
            value,
            graph_feats: BTreeMap::new(),
            features: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_graph_feats(mut self, graph_feats: BTreeMap<String, f64>) -> Self {
        self.graph_feats = graph_feats;
        self
    }

    /// Cached feature vector (fingerprint followed by graph features)
    pub fn features(&self) -> Option<&[f64]> {
        self.features.as_deref()
    }

    pub fn is_featurized(&self) -> bool {
        self.features.is_some()
    }

    pub(crate) fn attach_features(&mut self, features: Arc<[f64]>) {
        if self.features.is_none() {
            self.features = Some(features);
        }
    }
}

/// A set of properties modeled jointly by one model family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyGroup {
    pub name: String,
    properties: Vec<String>,
}

impl PropertyGroup {
    /// Properties are kept sorted so selector positions are stable
    pub fn new<I, S>(name: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut properties: Vec<String> = properties.into_iter().map(Into::into).collect();
        properties.sort();
        properties.dedup();
        Self {
            name: name.into(),
            properties,
        }
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// 0 for a single-property group, otherwise the number of properties
    pub fn selector_dim(&self) -> usize {
        if self.properties.len() == 1 {
            0
        } else {
            self.properties.len()
        }
    }

    pub fn selector_index(&self, prop: &str) -> Option<usize> {
        self.properties.binary_search_by(|p| p.as_str().cmp(prop)).ok()
    }

    /// Whether a record belongs to this group
    pub fn contains(&self, record: &Record) -> bool {
        let group_matches = record.group.as_deref().map_or(true, |g| g == self.name);
        group_matches && self.selector_index(&record.prop).is_some()
    }
}

/// Column layout of the model input matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    /// Fingerprint length
    pub n_fingerprint: usize,
    /// Graph feature names in column order
    pub graph_features: Vec<String>,
    /// Width of the one-hot property selector
    pub selector_dim: usize,
}

impl FeatureLayout {
    /// Graph feature names are the sorted union over `records`
    pub fn from_records(n_fingerprint: usize, records: &[Record], group: &PropertyGroup) -> Self {
        let mut names: Vec<String> = records
            .iter()
            .flat_map(|r| r.graph_feats.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        Self {
            n_fingerprint,
            graph_features: names,
            selector_dim: group.selector_dim(),
        }
    }

    /// Length of the cached per-record feature vector
    pub fn feature_dim(&self) -> usize {
        self.n_fingerprint + self.graph_features.len()
    }

    /// Number of model input columns
    pub fn input_dim(&self) -> usize {
        self.feature_dim() + self.selector_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_dim() {
        let single = PropertyGroup::new("tg", ["Tg"]);
        assert_eq!(single.selector_dim(), 0);

        let multi = PropertyGroup::new("electronic", ["Egc", "Egb", "Ea", "Ei"]);
        assert_eq!(multi.selector_dim(), 4);
        assert_eq!(multi.properties(), &["Ea", "Egb", "Egc", "Ei"]);
        assert_eq!(multi.selector_index("Egc"), Some(2));
        assert_eq!(multi.selector_index("Tg"), None);
    }

    #[test]
    fn test_group_membership_checks_row_group() {
        let group = PropertyGroup::new("electronic", ["Egc"]);
        assert!(group.contains(&Record::new("CC", "Egc", 1.0)));
        assert!(group.contains(&Record::new("CC", "Egc", 1.0).with_group("electronic")));
        assert!(!group.contains(&Record::new("CC", "Egc", 1.0).with_group("thermal")));
        assert!(!group.contains(&Record::new("CC", "Tg", 1.0)));
    }

    #[test]
    fn test_layout_dims() {
        let group = PropertyGroup::new("g", ["a", "b"]);
        let mut feats = BTreeMap::new();
        feats.insert("mw".to_string(), 10.0);
        let records = vec![Record::new("C", "a", 1.0).with_graph_feats(feats)];
        let layout = FeatureLayout::from_records(16, &records, &group);
        assert_eq!(layout.feature_dim(), 17);
        assert_eq!(layout.input_dim(), 19);
    }
}
