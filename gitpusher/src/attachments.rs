//! Copying attachments from the source into the destination content store.

use tigrisfetcher::models::{Attachment, SourceRecord};

use crate::context::PushContext;
use crate::error::Result;

async fn fetch_with_retry(
    ctx: &PushContext,
    attachment: &Attachment,
) -> tigrisfetcher::Result<Vec<u8>> {
    let policy = ctx.settings.attachment_retry;
    let mut attempt = 1;
    loop {
        match ctx.source.fetch_attachment(attachment).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                log::warn!(
                    "attachment {}: fetch attempt {attempt} failed ({err})",
                    attachment.attach_id
                );
                ctx.sleeper.sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Uploads every attachment of `record` not yet present in the store and
/// returns how many were written.
///
/// Attachments whose payload cannot be obtained for good (no payload, bad
/// encoding, client errors) are skipped with a warning; their reference line
/// still appears in the body. Transient fetch failures that outlast the
/// attachment retry budget fail the record so the upsert retry picks it up.
pub async fn upload_attachments(ctx: &PushContext, record: &SourceRecord) -> Result<usize> {
    let mut uploaded = 0;
    for attachment in &record.attachments {
        let path = attachment.content_path();
        if ctx.content.exists(&path).await? {
            log::debug!("{path} already stored");
            continue;
        }

        let bytes = match fetch_with_retry(ctx, attachment).await {
            Ok(bytes) => bytes,
            Err(err) if !err.is_transient() => {
                log::warn!("issue {}: skipping attachment {path}: {err}", record.id);
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let message = format!(
            "Add attachment {} of issue {}",
            attachment.attach_id, record.id
        );
        ctx.mutate(|| ctx.content.put(&path, &bytes, &message))
            .await?;
        log::info!("uploaded {path} ({} bytes)", bytes.len());
        uploaded += 1;
    }
    Ok(uploaded)
}
