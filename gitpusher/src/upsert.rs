//! Idempotent creation and population of destination issues.

use std::collections::BTreeSet;

use mstorage::models::{RecordCategory, RecordState};
use mstorage::timestamps::{time_tuple, TimestampWriter};
use tigrisfetcher::SourceRecord;

use crate::attachments::upload_attachments;
use crate::client::RemoteIssue;
use crate::compose;
use crate::context::PushContext;
use crate::error::{PushError, Result};
use crate::mapper::ReconciliationMap;

/// Title of freshly created issues until their record is written into them.
pub const PLACEHOLDER_TITLE: &str = "Placeholder for a migrated issue";

/// Finds or creates the destination issue that `destination_id` designates.
///
/// When the destination assigns a lower number than intended, placeholders
/// are created until the counter reaches the slot; they are overwritten when
/// the records they belong to are pushed. When the slot is taken by someone
/// else in the meantime, that issue becomes the target.
async fn resolve_target(
    ctx: &PushContext,
    record: &SourceRecord,
    destination_id: u64,
) -> Result<RemoteIssue> {
    if let Some(existing) = ctx.tracker.get_issue(destination_id).await? {
        return claim(existing, destination_id);
    }

    let mut previous = 0;
    loop {
        let created = ctx
            .mutate(|| ctx.tracker.create_issue(PLACEHOLDER_TITLE))
            .await?;
        if created.number == destination_id {
            log::info!("created #{destination_id} for source {}", record.id);
            return Ok(created);
        }
        if created.number <= previous {
            return Err(PushError::Conflict {
                destination_id,
                reason: format!(
                    "destination numbering went backwards ({} after {previous})",
                    created.number
                ),
            });
        }
        previous = created.number;

        if created.number < destination_id {
            log::warn!(
                "destination assigned #{} while #{destination_id} was intended; keeping it as a placeholder",
                created.number
            );
            continue;
        }

        log::warn!(
            "race on #{destination_id}: new issue became #{}, re-reading the slot",
            created.number
        );
        return match ctx.tracker.get_issue(destination_id).await? {
            Some(occupant) => claim(occupant, destination_id),
            None => Err(PushError::Conflict {
                destination_id,
                reason: format!("numbering moved past the slot to #{}", created.number),
            }),
        };
    }
}

pub(crate) fn claim(issue: RemoteIssue, destination_id: u64) -> Result<RemoteIssue> {
    if issue.is_pull_request {
        return Err(PushError::Structural(format!(
            "#{destination_id} is a pull request; the id map is out of date"
        )));
    }
    Ok(issue)
}

/// Brings destination issue `destination_id` in line with `record`.
///
/// Every step overwrites rather than appends, so repeating the call after a
/// partial failure converges on the same issue.
pub async fn upsert(
    ctx: &PushContext,
    record: &SourceRecord,
    destination_id: u64,
) -> Result<RemoteIssue> {
    let target = resolve_target(ctx, record, destination_id).await?;
    if let Some(catalog) = &ctx.catalog {
        catalog.advance_record(record.id, target.number, RecordState::Created)?;
    }

    upload_attachments(ctx, record).await?;

    let body = compose::issue_body(record, |attachment| ctx.link_for(attachment));
    let milestone = match compose::milestone_title(record) {
        Some(title) => Some(
            ctx.mutate(|| ctx.tracker.find_or_create_milestone(title))
                .await?,
        ),
        None => None,
    };
    let patch = compose::full_patch(record, body, &ctx.labels, milestone);

    ctx.mutate(|| ctx.tracker.update_issue(target.number, &patch))
        .await
}

/// Appends the original times of the issue under its destination number.
///
/// Comments and attachments have no numbers of their own on this
/// destination, so only the issue is indexed.
pub fn record_timestamps(
    writer: &mut TimestampWriter,
    record: &SourceRecord,
    number: u64,
) -> Result<()> {
    writer.append(
        RecordCategory::Issue,
        &number.to_string(),
        &time_tuple(&record.created_at),
        &time_tuple(&record.last_activity),
    )?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct PushReport {
    /// `(source id, destination number)` of every populated record.
    pub pushed: Vec<(u64, u64)>,
    pub skipped: Vec<u64>,
    pub failed: Vec<(u64, PushError)>,
    /// Destination numbers still holding a placeholder after the run.
    pub placeholders: Vec<u64>,
}

impl PushReport {
    pub fn summary(&self) -> String {
        format!(
            "{} pushed, {} already done, {} failed, {} placeholders left",
            self.pushed.len(),
            self.skipped.len(),
            self.failed.len(),
            self.placeholders.len()
        )
    }
}

/// Catalog state of `source_id`, `None` without a catalog or entry.
pub(crate) fn recorded_state(ctx: &PushContext, source_id: u64) -> Result<Option<RecordState>> {
    match &ctx.catalog {
        Some(catalog) => Ok(catalog.get_record(source_id)?.map(|progress| progress.state)),
        None => Ok(None),
    }
}

pub(crate) fn already_done(
    ctx: &PushContext,
    source_id: u64,
    state: RecordState,
) -> Result<bool> {
    if !ctx.resume {
        return Ok(false);
    }
    Ok(recorded_state(ctx, source_id)?.is_some_and(|current| current >= state))
}

/// Slots of records that were neither pushed nor skipped but hold an issue
/// that still carries the placeholder title.
async fn leftover_placeholders(
    ctx: &PushContext,
    map: &ReconciliationMap,
    report: &PushReport,
) -> Vec<u64> {
    let done: BTreeSet<u64> = report
        .pushed
        .iter()
        .map(|(source_id, _)| *source_id)
        .chain(report.skipped.iter().copied())
        .collect();

    let mut leftovers = Vec::new();
    for (source_id, number) in map.iter().filter(|(id, _)| !done.contains(id)) {
        match ctx.tracker.get_issue(number).await {
            Ok(Some(issue)) if !issue.is_pull_request && issue.title == PLACEHOLDER_TITLE => {
                log::warn!(
                    "#{number} still holds a placeholder; source {source_id} was not pushed"
                );
                leftovers.push(number);
            }
            Ok(_) => {}
            Err(err) => log::warn!("could not check #{number} for a placeholder: {err}"),
        }
    }
    leftovers
}

/// Pushes `records` in ascending source id order.
///
/// A record that exhausts its retries is reported and the run moves on; a
/// structural error stops the run.
pub async fn push_all(
    ctx: &PushContext,
    records: &[SourceRecord],
    map: &ReconciliationMap,
    writer: &mut TimestampWriter,
) -> Result<PushReport> {
    let mut ordered: Vec<&SourceRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.id);

    let mut report = PushReport::default();
    for record in ordered {
        let Some(destination_id) = map.get(record.id) else {
            log::warn!("source {} is outside the id map, skipping", record.id);
            report.failed.push((
                record.id,
                PushError::InvalidParam(format!("source {} has no destination number", record.id)),
            ));
            continue;
        };
        if already_done(ctx, record.id, RecordState::Populated)? {
            log::debug!("source {} already populated", record.id);
            report.skipped.push(record.id);
            continue;
        }

        match ctx
            .with_retry(record.id, destination_id, || upsert(ctx, record, destination_id))
            .await
        {
            Ok(issue) => {
                record_timestamps(writer, record, issue.number)?;
                if let Some(catalog) = &ctx.catalog {
                    catalog.advance_record(record.id, issue.number, RecordState::Populated)?;
                }
                log::info!("source {} -> #{}", record.id, issue.number);
                report.pushed.push((record.id, issue.number));
            }
            Err(err @ PushError::Structural(_)) => {
                log::error!("aborting push at source {}: {err}", record.id);
                return Err(err);
            }
            Err(err) => {
                log::error!("source {} -> #{destination_id} failed: {err}", record.id);
                report.failed.push((record.id, err));
            }
        }
    }
    writer.flush()?;
    report.placeholders = leftover_placeholders(ctx, map, &report).await;
    log::info!("push finished: {}", report.summary());
    Ok(report)
}
