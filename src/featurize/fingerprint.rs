//! Circular (Morgan-style) hashed fingerprint

use serde::{Deserialize, Serialize};

use super::smiles::{parse_smiles, Chirality, MolGraph};
use super::FeatureEncoder;
use crate::error::{MolPropError, Result};

/// djb2 over the little-endian bytes of each word, then a finalizer so small
/// identifiers spread over the whole bit range
fn hash_words(words: &[u64]) -> u64 {
    let mut hash: u64 = 5381;
    for word in words {
        for byte in word.to_le_bytes() {
            hash = ((hash << 5).wrapping_add(hash)).wrapping_add(byte as u64);
        }
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

/// Bit-vector fingerprint of circular atom environments up to `radius` bonds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedFingerprint {
    pub n_bits: usize,
    pub radius: usize,
    pub use_chirality: bool,
}

impl Default for HashedFingerprint {
    fn default() -> Self {
        Self {
            n_bits: 512,
            radius: 2,
            use_chirality: true,
        }
    }
}

impl HashedFingerprint {
    pub fn new(n_bits: usize) -> Self {
        Self {
            n_bits: n_bits.max(1),
            ..Self::default()
        }
    }

    pub fn with_radius(mut self, radius: usize) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_chirality(mut self, use_chirality: bool) -> Self {
        self.use_chirality = use_chirality;
        self
    }

    fn atom_invariants(&self, mol: &MolGraph) -> Vec<u64> {
        let adjacency = mol.adjacency();
        let rings = mol.ring_membership();
        mol.atoms()
            .iter()
            .enumerate()
            .map(|(i, atom)| {
                let chirality = match (self.use_chirality, atom.chirality) {
                    (true, Some(Chirality::CounterClockwise)) => 1,
                    (true, Some(Chirality::Clockwise)) => 2,
                    _ => 0,
                };
                hash_words(&[
                    atom.atomic_number as u64,
                    adjacency[i].len() as u64,
                    mol.total_h(i) as u64,
                    atom.charge as i64 as u64,
                    atom.isotope.unwrap_or(0) as u64,
                    rings[i] as u64,
                    chirality,
                ])
            })
            .collect()
    }

    /// Environment identifiers for every atom at every radius
    pub fn environment_ids(&self, mol: &MolGraph) -> Vec<u64> {
        let adjacency = mol.adjacency();
        let mut current = self.atom_invariants(mol);
        let mut ids = current.clone();

        for round in 1..=self.radius {
            let next: Vec<u64> = current
                .iter()
                .enumerate()
                .map(|(i, &own)| {
                    let mut neighbors: Vec<(u64, u64)> = adjacency[i]
                        .iter()
                        .map(|&(j, order)| (order.code(), current[j]))
                        .collect();
                    neighbors.sort_unstable();
                    let mut words = Vec::with_capacity(2 + 2 * neighbors.len());
                    words.push(round as u64);
                    words.push(own);
                    for (order, id) in neighbors {
                        words.push(order);
                        words.push(id);
                    }
                    hash_words(&words)
                })
                .collect();
            ids.extend_from_slice(&next);
            current = next;
        }

        ids
    }
}

impl FeatureEncoder for HashedFingerprint {
    fn n_features(&self) -> usize {
        self.n_bits
    }

    fn encode(&self, identifier: &str) -> Result<Vec<f64>> {
        if self.n_bits == 0 {
            return Err(MolPropError::ConfigError("fingerprint length must be positive".to_string()));
        }
        // Polymer repeat-unit endpoints are capped with hydrogen
        let capped = identifier.replace('*', "H");
        let mol = parse_smiles(&capped).map_err(|e| match e {
            MolPropError::FeaturizationError { reason, .. } => MolPropError::FeaturizationError {
                identifier: identifier.to_string(),
                reason,
            },
            other => other,
        })?;

        let mut bits = vec![0.0; self.n_bits];
        for id in self.environment_ids(&mol) {
            bits[(id % self.n_bits as u64) as usize] = 1.0;
        }
        Ok(bits)
    }
}
