//! Chunked download of the source range into the raw lake.

use mstorage::lake::{BatchFile, Lake};

use crate::client::TrackerSource;
use crate::error::{FetchError, Result};

/// Options for one fetch run.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: u64,
    /// Leave chunks whose file is already present untouched.
    pub skip_existing: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            skip_existing: false,
        }
    }
}

/// Summary of a completed fetch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub written: Vec<BatchFile>,
    pub skipped: Vec<(u64, u64)>,
}

/// Partitions `[start, end]` into inclusive chunks of at most `batch_size`
/// ids. A size below 1 is treated as 1.
pub fn partition(start: u64, end: u64, batch_size: u64) -> Vec<(u64, u64)> {
    let size = batch_size.max(1);
    let mut chunks = Vec::new();
    if end < start {
        return chunks;
    }
    let mut first = start;
    loop {
        let last = first.saturating_add(size - 1).min(end);
        chunks.push((first, last));
        if last >= end {
            break;
        }
        first = last + 1;
    }
    chunks
}

/// Downloads every chunk of `[start, end]` and stores it in the lake.
///
/// Chunks are requested one at a time in ascending order. The first failing
/// chunk stops the run; files written before it stay in place.
pub async fn download_batches<S>(
    source: &S,
    lake: &Lake,
    start: u64,
    end: u64,
    options: BatchOptions,
) -> Result<FetchSummary>
where
    S: TrackerSource + ?Sized,
{
    if start == 0 {
        return Err(FetchError::InvalidParameters(
            "source ids start at 1".to_string(),
        ));
    }

    let chunks = partition(start, end, options.batch_size);
    log::info!(
        "fetching ids {start}-{end} in {} batches of up to {}",
        chunks.len(),
        options.batch_size.max(1)
    );

    let mut summary = FetchSummary::default();
    for (first, last) in chunks {
        if options.skip_existing && lake.batch_exists(first, last).await {
            log::debug!("batch {first}-{last} already present, skipping");
            summary.skipped.push((first, last));
            continue;
        }

        let wrap = |err: FetchError| FetchError::Batch {
            first,
            last,
            source: Box::new(err),
        };
        let bytes = source.export_range(first, last).await.map_err(wrap)?;
        let batch = lake
            .write_batch(first, last, &bytes)
            .await
            .map_err(|err| wrap(err.into()))?;
        log::info!("wrote {} ({} bytes)", batch.path.display(), bytes.len());
        summary.written.push(batch);
    }
    Ok(summary)
}
