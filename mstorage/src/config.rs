use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    /// Raw per-batch export files as returned by the source.
    pub raw_path: PathBuf,
    /// Append-only timestamp index files, one per record category.
    pub index_path: PathBuf,
    pub catalog_path: PathBuf,
    /// Persisted reconciliation map, shared between the push and link phases.
    pub mapping_path: PathBuf,
}

impl StorageConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            raw_path: base_path.join("raw"),
            index_path: base_path.join("index"),
            catalog_path: base_path.join("catalog.sqlite"),
            mapping_path: base_path.join("mapping.json"),
        }
    }
}
