//! Integration test: stratified splits and k-fold assignment on records

use std::collections::BTreeSet;

use molprop::data::{make_folds, split, Record};
use molprop::error::MolPropError;

fn records() -> Vec<Record> {
    let props = ["Egc", "Egb", "Ea", "Ei"];
    (0..97)
        .map(|i| Record::new(format!("{}O", "C".repeat(i + 1)), props[i % 7 % 4], i as f64))
        .collect()
}

fn smiles(records: &[Record]) -> BTreeSet<String> {
    records.iter().map(|r| r.smiles.clone()).collect()
}

#[test]
fn test_split_is_idempotent() {
    let data = records();
    let by_prop = |r: &Record| r.prop.clone();
    let (train_a, test_a) = split(&data, 0.2, by_prop, 100).unwrap();
    let (train_b, test_b) = split(&data, 0.2, by_prop, 100).unwrap();
    assert_eq!(train_a, train_b);
    assert_eq!(test_a, test_b);
}

#[test]
fn test_split_partitions_input() {
    let data = records();
    let (train, test) = split(&data, 0.2, |r: &Record| r.prop.clone(), 7).unwrap();

    let train_ids = smiles(&train);
    let test_ids = smiles(&test);
    assert!(train_ids.is_disjoint(&test_ids));
    assert_eq!(train_ids.union(&test_ids).count(), data.len());
    assert_eq!(test.len(), (data.len() as f64 * 0.2).ceil() as usize);
}

#[test]
fn test_every_class_on_both_sides() {
    let data = records();
    let (train, test) = split(&data, 0.1, |r: &Record| r.prop.clone(), 3).unwrap();
    let classes = |rs: &[Record]| rs.iter().map(|r| r.prop.clone()).collect::<BTreeSet<_>>();
    assert_eq!(classes(&train), classes(&data));
    assert_eq!(classes(&test), classes(&data));
}

#[test]
fn test_different_seed_changes_split() {
    let data = records();
    let (_, a) = split(&data, 0.2, |r: &Record| r.prop.clone(), 1).unwrap();
    let (_, b) = split(&data, 0.2, |r: &Record| r.prop.clone(), 2).unwrap();
    assert_ne!(smiles(&a), smiles(&b));
}

#[test]
fn test_singleton_class_cannot_be_stratified() {
    let mut data = records();
    data.push(Record::new("N", "Tg", 1.0));
    let err = split(&data, 0.2, |r: &Record| r.prop.clone(), 0).unwrap_err();
    assert!(matches!(err, MolPropError::InsufficientData(_)));
}

#[test]
fn test_folds_partition_for_any_k() {
    let data = records();
    for k in 2..=6 {
        let folds = make_folds(&data, k, |r: &Record| r.prop.clone(), 100).unwrap();
        assert_eq!(folds.n_folds(), k);

        let mut seen = vec![0usize; data.len()];
        for fold in folds.folds() {
            assert!(!fold.is_empty());
            for &i in fold {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "k = {}", k);

        let sizes: Vec<usize> = folds.folds().iter().map(Vec::len).collect();
        let spread = sizes.iter().max().unwrap() - sizes.iter().min().unwrap();
        assert!(spread <= 1, "k = {}, sizes {:?}", k, sizes);
    }
}

#[test]
fn test_fold_splits_hold_out_own_fold() {
    let data = records();
    let folds = make_folds(&data, 3, |r: &Record| r.prop.clone(), 100).unwrap();
    for split in folds.splits() {
        assert_eq!(split.val_indices, folds.fold(split.fold_idx));
        assert_eq!(split.train_indices.len() + split.val_indices.len(), data.len());
        let train: BTreeSet<usize> = split.train_indices.iter().copied().collect();
        assert!(split.val_indices.iter().all(|i| !train.contains(i)));
    }
}

#[test]
fn test_folds_reproducible_with_seed() {
    let data = records();
    let a = make_folds(&data, 4, |r: &Record| r.prop.clone(), 100).unwrap();
    let b = make_folds(&data, 4, |r: &Record| r.prop.clone(), 100).unwrap();
    assert_eq!(a.folds(), b.folds());
}

#[test]
fn test_fold_errors() {
    let data = records();
    assert!(matches!(
        make_folds(&data, 1, |r: &Record| r.prop.clone(), 0),
        Err(MolPropError::ConfigError(_))
    ));
    assert!(matches!(
        make_folds(&data[..2], 3, |r: &Record| r.prop.clone(), 0),
        Err(MolPropError::InsufficientData(_))
    ));
}
