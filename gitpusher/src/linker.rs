//! Second pass: cross-references between migrated issues.

use mstorage::models::RecordState;
use tigrisfetcher::SourceRecord;

use crate::client::IssuePatch;
use crate::compose;
use crate::context::PushContext;
use crate::error::{PushError, Result};
use crate::mapper::ReconciliationMap;
use crate::upsert::{already_done, claim, recorded_state};

#[derive(Debug, Default)]
pub struct LinkReport {
    pub linked: Vec<u64>,
    /// Already linked by an earlier run.
    pub skipped: Vec<u64>,
    /// Not fully pushed yet; linking them would hide a failed push.
    pub unpopulated: Vec<u64>,
    pub failed: Vec<(u64, PushError)>,
}

/// Rewrites the body of one issue as composed body plus relationship notes.
///
/// The body is rebuilt from the record each time, so running the linker
/// twice leaves the same text behind. The target must exist and be an issue.
pub async fn link_record(
    ctx: &PushContext,
    record: &SourceRecord,
    map: &ReconciliationMap,
) -> Result<u64> {
    let destination_id = map.get(record.id).ok_or_else(|| {
        PushError::InvalidParam(format!("source {} has no destination number", record.id))
    })?;

    let target = ctx
        .tracker
        .get_issue(destination_id)
        .await?
        .ok_or_else(|| PushError::NotFound(format!("#{destination_id} for source {}", record.id)))?;
    claim(target, destination_id)?;

    let mut body = compose::issue_body(record, |attachment| ctx.link_for(attachment));
    body.push_str(&compose::relationship_notes(record, map));
    let patch = IssuePatch {
        body: Some(body),
        ..IssuePatch::default()
    };

    ctx.with_retry(record.id, destination_id, || {
        ctx.mutate(|| ctx.tracker.update_issue(destination_id, &patch))
    })
    .await?;
    Ok(destination_id)
}

/// Links every record that has relationship edges. Must run after the whole
/// push phase so that every target exists.
///
/// With a catalog, only records it reports as populated are linked.
pub async fn link_all(
    ctx: &PushContext,
    records: &[SourceRecord],
    map: &ReconciliationMap,
) -> Result<LinkReport> {
    let mut report = LinkReport::default();
    for record in records.iter().filter(|r| !r.relationships.is_empty()) {
        if already_done(ctx, record.id, RecordState::Linked)? {
            report.skipped.push(record.id);
            continue;
        }
        if ctx.catalog.is_some()
            && recorded_state(ctx, record.id)?.map_or(true, |state| state < RecordState::Populated)
        {
            log::warn!("source {} is not fully pushed yet, not linking it", record.id);
            report.unpopulated.push(record.id);
            continue;
        }
        match link_record(ctx, record, map).await {
            Ok(number) => {
                if let Some(catalog) = &ctx.catalog {
                    catalog.advance_record(record.id, number, RecordState::Linked)?;
                }
                log::info!("linked source {} (#{number})", record.id);
                report.linked.push(record.id);
            }
            Err(err @ PushError::Structural(_)) => return Err(err),
            Err(err) => {
                log::error!("linking source {} failed: {err}", record.id);
                report.failed.push((record.id, err));
            }
        }
    }
    log::info!("link finished: {}", report.summary());
    Ok(report)
}

impl LinkReport {
    pub fn summary(&self) -> String {
        format!(
            "{} linked, {} already done, {} not pushed yet, {} failed",
            self.linked.len(),
            self.skipped.len(),
            self.unpopulated.len(),
            self.failed.len()
        )
    }
}
