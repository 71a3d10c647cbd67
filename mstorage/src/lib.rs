pub mod catalog;
pub mod config;
pub mod errors;
pub mod lake;
pub mod models;
pub mod patch;
pub mod timestamps;

use crate::catalog::Catalog;
use crate::config::StorageConfig;
use crate::errors::Result;
use crate::lake::Lake;
use crate::timestamps::TimestampWriter;
use std::sync::Arc;

/// The main entry point for the `mstorage` library.
///
/// `MStorage` bundles the on-disk state a migration run works with:
/// - the raw per-batch export files fetched from the source (`Lake`),
/// - a SQLite catalog of per-record progress, API budgets and task logs (`Catalog`),
/// - the append-only timestamp index consumed by the patch phase.
///
/// # Example
///
/// ```rust,no_run
/// use mstorage::{MStorage, config::StorageConfig};
/// use tempfile::tempdir;
///
/// #[tokio::main]
/// async fn main() {
///     let dir = tempdir().unwrap();
///     let config = StorageConfig::new(dir.path());
///     let storage = MStorage::new(config).await.unwrap();
///
///     // Now you can use storage.lake, storage.catalog, etc.
/// }
/// ```
pub struct MStorage {
    pub config: StorageConfig,
    pub catalog: Arc<Catalog>,
    pub lake: Arc<Lake>,
}

impl MStorage {
    /// Creates the storage directories and opens the catalog, initializing
    /// its schema if needed.
    pub async fn new(config: StorageConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.index_path).await?;

        let catalog = Arc::new(Catalog::new(&config)?);
        catalog.initialize_schema()?;

        let lake = Arc::new(Lake::new(config.clone()).await?);

        Ok(Self {
            config,
            catalog,
            lake,
        })
    }

    /// Opens the append-only timestamp index for the push phase.
    pub fn timestamp_writer(&self) -> Result<TimestampWriter> {
        TimestampWriter::open(&self.config)
    }

    /// Persists a JSON document next to the catalog, replacing it atomically.
    pub async fn write_json<T: serde::Serialize>(
        &self,
        path: &std::path::Path,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let staging = path.with_extension("json.part");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    pub async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &std::path::Path,
    ) -> Result<T> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                errors::StorageError::NotFound(path.display().to_string())
            } else {
                err.into()
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
