//! Records, loading, splitting and model-ready data

mod loader;
mod prepared;
mod record;
pub mod splitter;

pub use loader::{count_by_property, load_records, DatasetLoader};
pub use prepared::PreparedData;
pub use record::{FeatureLayout, PropertyGroup, Record};
pub use splitter::{make_folds, split, split_indices, FoldAssignment, FoldSplit, SplitIndices};
