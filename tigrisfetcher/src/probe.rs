//! Discovery of the highest record id at the source.

use std::future::Future;

use crate::client::TrackerSource;
use crate::error::{FetchError, Result};

pub const DEFAULT_STRIDE: u64 = 1024;

/// Finds the highest existing id, assuming ids are contiguous from `start`.
///
/// Gallops forward by `stride` until the predicate reports a miss, then
/// bisects the bracket. Returns 0 when `start` itself does not exist.
/// Predicate errors abort the search.
pub async fn highest_existing<F, Fut, E>(
    mut exists: F,
    start: u64,
    stride: u64,
) -> std::result::Result<u64, E>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
{
    let stride = stride.max(1);
    if !exists(start).await? {
        return Ok(0);
    }

    let mut left = start;
    let mut right = start.saturating_add(stride);
    while exists(right).await? {
        left = right;
        right = right.saturating_add(stride);
    }

    // left exists, right does not
    while right - left > 1 {
        let mid = left + (right - left) / 2;
        if exists(mid).await? {
            left = mid;
        } else {
            right = mid;
        }
    }
    Ok(left)
}

/// Runs [`highest_existing`] against a tracker source.
pub async fn probe_highest<S>(source: &S, start: u64, stride: u64) -> Result<u64>
where
    S: TrackerSource + ?Sized,
{
    let highest = highest_existing(
        |id| async move {
            let present = source.issue_exists(id).await?;
            log::debug!("probe {id}: {}", if present { "present" } else { "absent" });
            Ok::<bool, FetchError>(present)
        },
        start,
        stride,
    )
    .await?;
    log::info!("highest existing source id is {highest}");
    Ok(highest)
}
