//! CSV dataset loading
//!
//! One row per (molecule, property) observation. Required columns are
//! `smiles`, `prop` and `value`; `group` and `graph_feats` (a JSON object of
//! numbers) are optional. Any other column is ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use polars::prelude::*;
use tracing::info;

use super::record::Record;
use crate::error::{MolPropError, Result};

const SMILES_COL: &str = "smiles";
const PROP_COL: &str = "prop";
const VALUE_COL: &str = "value";
const GROUP_COL: &str = "group";
const GRAPH_FEATS_COL: &str = "graph_feats";

/// Reads record files into [`Record`]s
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    infer_schema_length: usize,
    require_targets: bool,
}

impl Default for DatasetLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetLoader {
    pub fn new() -> Self {
        Self {
            infer_schema_length: 1000,
            require_targets: true,
        }
    }

    /// Allow files without a `value` column. Missing targets load as NaN.
    pub fn with_optional_targets(mut self) -> Self {
        self.require_targets = false;
        self
    }

    pub fn with_infer_schema_length(mut self, n: usize) -> Self {
        self.infer_schema_length = n.max(1);
        self
    }

    /// Load a CSV file
    pub fn load_csv(&self, path: impl AsRef<Path>) -> Result<Vec<Record>> {
        let path = path.as_ref();
        let start = Instant::now();
        let file = File::open(path)
            .map_err(|e| MolPropError::DataError(format!("cannot open {}: {}", path.display(), e)))?;

        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(self.infer_schema_length))
            .into_reader_with_file_handle(file)
            .finish()?;

        let records = self.records_from_frame(&df)?;
        info!(
            path = %path.display(),
            rows = records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "loaded dataset"
        );
        Ok(records)
    }

    /// Convert an already loaded frame
    pub fn records_from_frame(&self, df: &DataFrame) -> Result<Vec<Record>> {
        let smiles = string_column(df, SMILES_COL)?
            .ok_or_else(|| missing_column(SMILES_COL))?;
        let props = string_column(df, PROP_COL)?.ok_or_else(|| missing_column(PROP_COL))?;
        let groups = string_column(df, GROUP_COL)?;
        let graph_feats = string_column(df, GRAPH_FEATS_COL)?;

        let values = match df.column(VALUE_COL) {
            Ok(column) => {
                let cast = column.as_materialized_series().cast(&DataType::Float64)?;
                cast.f64()?.into_iter().collect::<Vec<Option<f64>>>()
            }
            Err(_) if !self.require_targets => vec![Some(f64::NAN); df.height()],
            Err(_) => return Err(missing_column(VALUE_COL)),
        };

        let mut records = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let smiles = required_cell(&smiles, row, SMILES_COL)?;
            let prop = required_cell(&props, row, PROP_COL)?;
            let value = match values[row] {
                Some(value) => value,
                None if !self.require_targets => f64::NAN,
                None => return Err(null_cell(row, VALUE_COL)),
            };
            if self.require_targets && !value.is_finite() {
                return Err(MolPropError::DataError(format!(
                    "row {}: non-finite value {} for property '{}'",
                    row, value, prop
                )));
            }

            let mut record = Record::new(smiles, prop, value);
            if let Some(group) = groups.as_ref().and_then(|g| g[row].as_deref()) {
                if !group.is_empty() {
                    record = record.with_group(group);
                }
            }
            if let Some(raw) = graph_feats.as_ref().and_then(|g| g[row].as_deref()) {
                record = record.with_graph_feats(parse_graph_feats(raw, row)?);
            }
            records.push(record);
        }

        Ok(records)
    }
}

/// Load a labeled CSV dataset with the default loader
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    DatasetLoader::new().load_csv(path)
}

/// Row counts per property
pub fn count_by_property(records: &[Record]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.prop.clone()).or_insert(0) += 1;
    }
    counts
}

fn string_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<String>>>> {
    let column = match df.column(name) {
        Ok(column) => column,
        Err(_) => return Ok(None),
    };
    let cast = column.as_materialized_series().cast(&DataType::String)?;
    let values = cast
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()))
        .collect();
    Ok(Some(values))
}

fn required_cell(column: &[Option<String>], row: usize, name: &str) -> Result<String> {
    match column[row].as_deref() {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(null_cell(row, name)),
    }
}

fn parse_graph_feats(raw: &str, row: usize) -> Result<BTreeMap<String, f64>> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str::<BTreeMap<String, f64>>(raw).map_err(|e| {
        MolPropError::DataError(format!("row {}: malformed graph_feats {:?}: {}", row, raw, e))
    })
}

fn missing_column(name: &str) -> MolPropError {
    MolPropError::DataError(format!("required column '{}' not found", name))
}

fn null_cell(row: usize, name: &str) -> MolPropError {
    MolPropError::DataError(format!("row {}: missing value in column '{}'", row, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_minimal_columns() {
        let file = write_csv("idx,smiles,prop,value\n0,[*]CC[*],Tg,1.5\n1,[*]CC(C)[*],Tg,2\n");
        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].smiles, "[*]CC[*]");
        assert_eq!(records[1].value, 2.0);
        assert!(records[0].group.is_none());
        assert!(records[0].graph_feats.is_empty());
    }

    #[test]
    fn test_load_group_and_graph_feats() {
        let file = write_csv(
            "smiles,prop,group,value,graph_feats\n\
             CC,Egc,electronic,1.0,\"{\"\"mw\"\": 30.0}\"\n\
             CCC,Egb,electronic,2.0,\n",
        );
        let records = load_records(file.path()).unwrap();
        assert_eq!(records[0].group.as_deref(), Some("electronic"));
        assert_eq!(records[0].graph_feats.get("mw"), Some(&30.0));
        assert!(records[1].graph_feats.is_empty());
    }

    #[test]
    fn test_missing_required_column() {
        let file = write_csv("smiles,value\nCC,1.0\n");
        let err = load_records(file.path()).unwrap_err();
        assert!(err.to_string().contains("prop"));
    }

    #[test]
    fn test_null_value_is_data_error() {
        let file = write_csv("smiles,prop,value\nCC,Tg,1.0\nCCC,Tg,\n");
        assert!(matches!(
            load_records(file.path()),
            Err(MolPropError::DataError(_))
        ));
    }

    #[test]
    fn test_optional_targets() {
        let file = write_csv("smiles,prop\nCC,Tg\n");
        let records = DatasetLoader::new()
            .with_optional_targets()
            .load_csv(file.path())
            .unwrap();
        assert!(records[0].value.is_nan());
    }

    #[test]
    fn test_optional_targets_allow_empty_cells() {
        let file = write_csv("smiles,prop,value\nCC,Tg,1.0\nCCC,Tg,\n");
        let records = DatasetLoader::new()
            .with_optional_targets()
            .load_csv(file.path())
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, 1.0);
        assert!(records[1].value.is_nan());
    }

    #[test]
    fn test_count_by_property() {
        let records = vec![
            Record::new("C", "a", 1.0),
            Record::new("CC", "b", 1.0),
            Record::new("CCC", "a", 1.0),
        ];
        let counts = count_by_property(&records);
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 1);
    }
}
