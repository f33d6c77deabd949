//! Stratified train/test splitting and k-fold assignment
//!
//! All functions are pure: the same seed and the same input order always give
//! the same partition. Classes are visited in sorted key order so iteration
//! order never depends on hashing.

use std::collections::BTreeMap;
use std::fmt::Debug;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{MolPropError, Result};

/// Index partition produced by [`split_indices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

fn group_by_class<K: Ord>(keys: &[K]) -> BTreeMap<&K, Vec<usize>> {
    let mut classes: BTreeMap<&K, Vec<usize>> = BTreeMap::new();
    for (idx, key) in keys.iter().enumerate() {
        classes.entry(key).or_default().push(idx);
    }
    classes
}

/// Per-class test counts: largest-remainder share of the total, clamped so
/// every class keeps at least one member on each side
fn allocate_test_counts(sizes: &[usize], n_test: usize) -> Vec<usize> {
    let n: usize = sizes.iter().sum();
    let mut counts: Vec<usize> = Vec::with_capacity(sizes.len());
    let mut remainders: Vec<(usize, f64)> = Vec::with_capacity(sizes.len());

    for (i, &size) in sizes.iter().enumerate() {
        let quota = n_test as f64 * size as f64 / n as f64;
        counts.push(quota.floor() as usize);
        remainders.push((i, quota - quota.floor()));
    }

    let assigned: usize = counts.iter().sum();
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    for &(i, _) in remainders.iter().take(n_test.saturating_sub(assigned)) {
        counts[i] += 1;
    }

    counts
        .into_iter()
        .zip(sizes)
        .map(|(c, &size)| c.clamp(1, size - 1))
        .collect()
}

/// Stratified split of positions `0..keys.len()` into train and test indices.
/// Both outputs are sorted ascending.
pub fn split_indices<K: Ord + Debug>(keys: &[K], test_fraction: f64, seed: u64) -> Result<SplitIndices> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(MolPropError::ConfigError(format!(
            "test_fraction must lie in (0, 1), got {}",
            test_fraction
        )));
    }
    if keys.is_empty() {
        return Err(MolPropError::InsufficientData("cannot split an empty dataset".to_string()));
    }

    let mut classes = group_by_class(keys);
    for (key, members) in &classes {
        if members.len() < 2 {
            return Err(MolPropError::InsufficientData(format!(
                "class {:?} has {} member(s); at least 2 are needed to stratify",
                key,
                members.len()
            )));
        }
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for members in classes.values_mut() {
        members.shuffle(&mut rng);
    }

    let n_test = ((keys.len() as f64 * test_fraction) - 1e-9).ceil().max(1.0) as usize;
    let sizes: Vec<usize> = classes.values().map(Vec::len).collect();
    let counts = allocate_test_counts(&sizes, n_test);

    let mut train = Vec::with_capacity(keys.len());
    let mut test = Vec::with_capacity(n_test);
    for (members, count) in classes.values().zip(counts) {
        test.extend_from_slice(&members[..count]);
        train.extend_from_slice(&members[count..]);
    }
    train.sort_unstable();
    test.sort_unstable();

    Ok(SplitIndices { train, test })
}

/// Stratified split of `items` into `(train, test)`, preserving input order
pub fn split<T, K, F>(items: &[T], test_fraction: f64, stratify_by: F, seed: u64) -> Result<(Vec<T>, Vec<T>)>
where
    T: Clone,
    K: Ord + Debug,
    F: Fn(&T) -> K,
{
    let keys: Vec<K> = items.iter().map(&stratify_by).collect();
    let indices = split_indices(&keys, test_fraction, seed)?;
    let train = indices.train.iter().map(|&i| items[i].clone()).collect();
    let test = indices.test.iter().map(|&i| items[i].clone()).collect();
    Ok((train, test))
}

/// One held-out fold and the indices used to train against it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    pub fold_idx: usize,
    pub train_indices: Vec<usize>,
    pub val_indices: Vec<usize>,
}

/// Partition of `0..n_samples` into disjoint, non-empty folds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    folds: Vec<Vec<usize>>,
    n_samples: usize,
}

impl FoldAssignment {
    /// Validate that `folds` partition `0..n_samples`
    pub fn new(folds: Vec<Vec<usize>>, n_samples: usize) -> Result<Self> {
        let mut owner = vec![None; n_samples];
        for (fold_idx, fold) in folds.iter().enumerate() {
            if fold.is_empty() {
                return Err(MolPropError::InsufficientData(format!("fold {} is empty", fold_idx)));
            }
            for &idx in fold {
                match owner.get_mut(idx) {
                    Some(slot @ None) => *slot = Some(fold_idx),
                    Some(Some(other)) => {
                        return Err(MolPropError::DataError(format!(
                            "index {} assigned to folds {} and {}",
                            idx, other, fold_idx
                        )))
                    }
                    None => {
                        return Err(MolPropError::DataError(format!(
                            "index {} out of range for {} samples",
                            idx, n_samples
                        )))
                    }
                }
            }
        }
        if let Some(missing) = owner.iter().position(Option::is_none) {
            return Err(MolPropError::DataError(format!("index {} is not assigned to any fold", missing)));
        }
        Ok(Self { folds, n_samples })
    }

    pub fn n_folds(&self) -> usize {
        self.folds.len()
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn fold(&self, fold_idx: usize) -> &[usize] {
        &self.folds[fold_idx]
    }

    pub fn folds(&self) -> &[Vec<usize>] {
        &self.folds
    }

    /// Train on every other fold, validate on `fold_idx`
    pub fn split(&self, fold_idx: usize) -> FoldSplit {
        let mut train_indices: Vec<usize> = self
            .folds
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != fold_idx)
            .flat_map(|(_, f)| f.iter().copied())
            .collect();
        train_indices.sort_unstable();

        FoldSplit {
            fold_idx,
            train_indices,
            val_indices: self.folds[fold_idx].clone(),
        }
    }

    pub fn splits(&self) -> impl Iterator<Item = FoldSplit> + '_ {
        (0..self.folds.len()).map(move |i| self.split(i))
    }
}

/// Stratified assignment of `items` to `k` folds
pub fn make_folds<T, K, F>(items: &[T], k: usize, stratify_by: F, seed: u64) -> Result<FoldAssignment>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    if k < 2 {
        return Err(MolPropError::ConfigError(format!("n_folds must be at least 2, got {}", k)));
    }
    if items.len() < k {
        return Err(MolPropError::InsufficientData(format!(
            "{} records cannot fill {} folds",
            items.len(),
            k
        )));
    }

    let keys: Vec<K> = items.iter().map(stratify_by).collect();
    let mut classes = group_by_class(&keys);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for members in classes.values_mut() {
        members.shuffle(&mut rng);
    }

    // The deal position carries over between classes so fold sizes differ by at most one
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut position = 0;
    for members in classes.values() {
        for &idx in members {
            folds[position % k].push(idx);
            position += 1;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }

    FoldAssignment::new(folds, items.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n_a: usize, n_b: usize) -> Vec<&'static str> {
        let mut keys = vec!["a"; n_a];
        keys.extend(vec!["b"; n_b]);
        keys
    }

    #[test]
    fn test_split_sizes_and_disjoint() {
        let keys = vec!["p"; 100];
        let s = split_indices(&keys, 0.2, 100).unwrap();
        assert_eq!(s.test.len(), 20);
        assert_eq!(s.train.len(), 80);

        let mut all: Vec<usize> = s.train.iter().chain(s.test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_deterministic() {
        let keys = keys(30, 20);
        let a = split_indices(&keys, 0.25, 7).unwrap();
        let b = split_indices(&keys, 0.25, 7).unwrap();
        assert_eq!(a, b);
        let c = split_indices(&keys, 0.25, 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_split_keeps_every_class_on_both_sides() {
        let keys = keys(40, 3);
        let s = split_indices(&keys, 0.2, 1).unwrap();
        assert!(s.test.iter().any(|&i| keys[i] == "b"));
        assert!(s.train.iter().any(|&i| keys[i] == "b"));
        assert!(s.test.iter().any(|&i| keys[i] == "a"));
    }

    #[test]
    fn test_split_rejects_singleton_class() {
        let keys = keys(10, 1);
        assert!(matches!(
            split_indices(&keys, 0.2, 1),
            Err(MolPropError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        let keys = keys(10, 10);
        assert!(matches!(split_indices(&keys, 1.0, 1), Err(MolPropError::ConfigError(_))));
        assert!(matches!(split_indices(&keys, 0.0, 1), Err(MolPropError::ConfigError(_))));
    }

    #[test]
    fn test_split_items_preserves_order() {
        let items: Vec<(usize, &str)> = (0..20).map(|i| (i, if i % 2 == 0 { "a" } else { "b" })).collect();
        let (train, test) = split(&items, 0.3, |it| it.1, 3).unwrap();
        assert!(train.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(test.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(train.len() + test.len(), 20);
    }

    #[test]
    fn test_folds_partition() {
        let keys = keys(17, 8);
        let folds = make_folds(&keys, 3, |k| *k, 100).unwrap();
        assert_eq!(folds.n_folds(), 3);

        let mut seen: Vec<usize> = folds.folds().iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());

        let sizes: Vec<usize> = folds.folds().iter().map(Vec::len).collect();
        let spread = sizes.iter().max().unwrap() - sizes.iter().min().unwrap();
        assert!(spread <= 1, "fold sizes {:?}", sizes);
    }

    #[test]
    fn test_folds_are_stratified() {
        let keys = keys(30, 9);
        let folds = make_folds(&keys, 3, |k| *k, 5).unwrap();
        for fold in folds.folds() {
            let n_b = fold.iter().filter(|&&i| keys[i] == "b").count();
            assert_eq!(n_b, 3);
        }
    }

    #[test]
    fn test_fold_split_complements() {
        let keys = vec![0u8; 10];
        let folds = make_folds(&keys, 5, |k| *k, 1).unwrap();
        for split in folds.splits() {
            assert_eq!(split.train_indices.len() + split.val_indices.len(), 10);
            assert!(split.val_indices.iter().all(|i| !split.train_indices.contains(i)));
        }
    }

    #[test]
    fn test_folds_errors() {
        let keys = vec![0u8; 2];
        assert!(matches!(make_folds(&keys, 1, |k| *k, 1), Err(MolPropError::ConfigError(_))));
        assert!(matches!(make_folds(&keys, 3, |k| *k, 1), Err(MolPropError::InsufficientData(_))));
    }

    #[test]
    fn test_assignment_validation() {
        assert!(FoldAssignment::new(vec![vec![0, 1], vec![1, 2]], 3).is_err());
        assert!(FoldAssignment::new(vec![vec![0], vec![]], 1).is_err());
        assert!(FoldAssignment::new(vec![vec![0], vec![2]], 3).is_err());
        assert!(FoldAssignment::new(vec![vec![0, 2], vec![1]], 3).is_ok());
    }
}
