//! Source side of the migration: discovering, downloading and decoding the
//! Issuezilla exports of a Tigris project.

pub mod batch;
pub mod client;
pub mod error;
pub mod models;
pub mod probe;
pub mod xml;

pub use batch::{download_batches, BatchOptions, FetchSummary};
pub use client::{TigrisClient, TrackerSource};
pub use error::{FetchError, Result};
pub use models::SourceRecord;
pub use probe::{highest_existing, probe_highest};

use mstorage::lake::Lake;

/// Every record decoded from the lake, plus what could not be decoded.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    /// Ordered by source id, one per id.
    pub records: Vec<SourceRecord>,
    /// Highest id covered by a downloaded batch, decodable or not.
    pub highest_fetched: u64,
    /// Batches left out, each wrapped in [`FetchError::Batch`].
    pub failed_batches: Vec<FetchError>,
}

/// Loads and decodes every batch in the lake, ordered by source id.
///
/// A batch that cannot be read or decoded is logged and reported; the other
/// batches still load. Individual malformed issues inside a batch are logged
/// and left out.
pub async fn load_records(lake: &Lake) -> Result<LoadedRecords> {
    let mut loaded = LoadedRecords::default();
    for batch in lake.list_batches().await? {
        loaded.highest_fetched = loaded.highest_fetched.max(batch.last);
        let decoded = match lake.read_batch(&batch).await {
            Ok(bytes) => xml::parse_export(&bytes),
            Err(err) => Err(err.into()),
        };
        let parsed = match decoded {
            Ok(parsed) => parsed,
            Err(err) => {
                log::error!("skipping {}: {err}", batch.path.display());
                loaded.failed_batches.push(FetchError::Batch {
                    first: batch.first,
                    last: batch.last,
                    source: Box::new(err),
                });
                continue;
            }
        };
        if !parsed.missing.is_empty() {
            log::debug!(
                "{} ids in {} are absent at the source",
                parsed.missing.len(),
                batch.path.display()
            );
        }
        if !parsed.rejected.is_empty() {
            log::warn!(
                "{} malformed issues skipped in {}",
                parsed.rejected.len(),
                batch.path.display()
            );
        }
        loaded.records.extend(parsed.records);
    }
    loaded.records.sort_by_key(|r| r.id);
    loaded.records.dedup_by_key(|r| r.id);
    Ok(loaded)
}
