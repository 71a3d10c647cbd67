//! Bulk import of source records into a Roundup tracker.
//!
//! Users and keywords are created first, then per record its messages, its
//! files and finally the issue linking them. The ids Roundup assigns are
//! what its flat export is keyed by, so those ids go into the timestamp
//! index together with the original times.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDateTime;
use mstorage::models::RecordCategory;
use mstorage::timestamps::{time_tuple, TimestampWriter};
use tigrisfetcher::models::{IssueStatus, IssueType};
use tigrisfetcher::{SourceRecord, TrackerSource};

use crate::client::{Property, RoundupTracker};
use crate::error::{Result, RoundupError};

/// User id that stands in for people without an account.
pub const FALLBACK_USER: &str = "1";

// Ids of the classic Roundup schema.
const PRIORITY_FEATURE: u32 = 4;
const PRIORITY_BUG: u32 = 3;
const PRIORITY_WISH: u32 = 5;
const STATUS_UNREAD: u32 = 1;
const STATUS_CHATTING: u32 = 3;
const STATUS_IN_PROGRESS: u32 = 5;
const STATUS_RESOLVED: u32 = 8;

/// A project member from the `username;realname;roles` member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub username: String,
    pub realname: String,
}

/// Reads the member list. The first line is a header.
pub fn read_members(path: &Path) -> Result<Vec<Member>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(path)?;

    let mut members = Vec::new();
    for row in reader.records() {
        let row = row?;
        let username = row.get(0).unwrap_or_default().trim();
        if username.is_empty() {
            continue;
        }
        members.push(Member {
            username: username.to_string(),
            realname: row.get(1).unwrap_or_default().trim().to_string(),
        });
    }
    Ok(members)
}

/// Tracker ids of the users and keywords created for the import.
#[derive(Debug, Default, Clone)]
pub struct Directory {
    users: HashMap<String, String>,
    keywords: HashMap<String, String>,
}

impl Directory {
    pub fn user(&self, name: &str) -> &str {
        self.users
            .get(name)
            .map(String::as_str)
            .unwrap_or(FALLBACK_USER)
    }

    pub fn keyword(&self, name: &str) -> Option<&str> {
        self.keywords.get(name).map(String::as_str)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }
}

/// Creates the listed members, then every other user and keyword the records
/// mention.
pub async fn build_directory<T>(
    tracker: &T,
    members: &[Member],
    records: &[&SourceRecord],
) -> Result<Directory>
where
    T: RoundupTracker + ?Sized,
{
    let mut directory = Directory::default();
    for member in members {
        if directory.users.contains_key(&member.username) {
            continue;
        }
        let id = tracker
            .create(
                "user",
                &[
                    Property::text("username", &member.username),
                    Property::text("realname", &member.realname),
                    Property::text("roles", "User"),
                ],
            )
            .await?;
        directory.users.insert(member.username.clone(), id);
    }
    log::info!("{} users added from the member list", directory.users.len());

    for record in records {
        let people = record
            .reporter
            .iter()
            .chain(record.assignee.iter())
            .chain(record.comments.iter().map(|comment| &comment.author));
        for name in people {
            if name.is_empty() || directory.users.contains_key(name) {
                continue;
            }
            let id = tracker
                .create(
                    "user",
                    &[
                        Property::text("username", name),
                        Property::text("roles", "User"),
                    ],
                )
                .await?;
            directory.users.insert(name.clone(), id);
        }

        for keyword in &record.keywords {
            if keyword.is_empty() || directory.keywords.contains_key(keyword) {
                continue;
            }
            let id = tracker
                .create("keyword", &[Property::text("name", keyword)])
                .await?;
            directory.keywords.insert(keyword.clone(), id);
        }
    }

    log::info!(
        "directory ready: {} users, {} keywords",
        directory.user_count(),
        directory.keyword_count()
    );
    Ok(directory)
}

/// Roundup `(priority, status)` ids for a record.
pub fn priority_and_status(record: &SourceRecord) -> (u32, u32) {
    let priority = match record.issue_type {
        IssueType::Enhancement => PRIORITY_WISH,
        IssueType::Task => PRIORITY_FEATURE,
        _ => PRIORITY_BUG,
    };
    let status = match record.status {
        IssueStatus::Started | IssueStatus::Reopened => STATUS_IN_PROGRESS,
        IssueStatus::Verified => STATUS_CHATTING,
        IssueStatus::Resolved | IssueStatus::Closed => STATUS_RESOLVED,
        _ => STATUS_UNREAD,
    };
    (priority, status)
}

/// Date as Roundup parses it: `2001-01-02.03:04:05`.
pub fn roundup_date(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d.%H:%M:%S").to_string()
}

/// Creates the messages, files and issue of one record. Returns the issue id.
///
/// Attachments whose content cannot be fetched are left out with a warning.
pub async fn push_record<T, S>(
    tracker: &T,
    source: &S,
    record: &SourceRecord,
    directory: &Directory,
    writer: &mut TimestampWriter,
) -> Result<String>
where
    T: RoundupTracker + ?Sized,
    S: TrackerSource + ?Sized,
{
    let mut messages = Vec::new();
    for comment in record.comments.iter().filter(|c| !c.text.is_empty()) {
        let id = tracker
            .create(
                "msg",
                &[
                    Property::text("author", directory.user(&comment.author)),
                    Property::text("date", roundup_date(&comment.created_at)),
                    Property::text("content", &comment.text),
                ],
            )
            .await?;
        let stamp = time_tuple(&comment.created_at);
        writer.append(RecordCategory::Message, &id, &stamp, &stamp)?;
        messages.push(id);
    }

    let mut files = Vec::new();
    for attachment in &record.attachments {
        let content = match source.fetch_attachment(attachment).await {
            Ok(content) => content,
            Err(err) => {
                log::warn!(
                    "source {}: leaving out attachment {} ({err})",
                    record.id,
                    attachment.attach_id
                );
                continue;
            }
        };
        log::debug!(
            "pushing file {} ({} bytes)",
            attachment.filename,
            content.len()
        );
        let mut properties = vec![Property::text("name", &attachment.filename)];
        if let Some(mime_type) = &attachment.mime_type {
            properties.push(Property::text("type", mime_type));
        }
        properties.push(Property::Binary("content".to_string(), content));

        let id = tracker.create("file", &properties).await?;
        let stamp = time_tuple(&attachment.created_at);
        writer.append(RecordCategory::File, &id, &stamp, &stamp)?;
        files.push(id);
    }

    let (priority, status) = priority_and_status(record);
    let assignee = record.assignee.as_deref().unwrap_or_default();
    let mut properties = vec![
        Property::text("title", &record.title),
        Property::text("priority", priority.to_string()),
        Property::text("status", status.to_string()),
        Property::text("assignedto", directory.user(assignee)),
    ];
    let keywords: Vec<&str> = record
        .keywords
        .iter()
        .filter_map(|keyword| directory.keyword(keyword))
        .collect();
    if !keywords.is_empty() {
        properties.push(Property::text("keyword", keywords.join(",")));
    }
    if !files.is_empty() {
        properties.push(Property::text("files", files.join(",")));
    }
    if !messages.is_empty() {
        properties.push(Property::text("messages", messages.join(",")));
    }

    let issue_id = tracker.create("issue", &properties).await?;
    writer.append(
        RecordCategory::Issue,
        &issue_id,
        &time_tuple(&record.created_at),
        &time_tuple(&record.last_activity),
    )?;
    Ok(issue_id)
}

#[derive(Debug, Default)]
pub struct RoundupReport {
    /// `(source id, Roundup issue id)` of every imported record.
    pub pushed: Vec<(u64, String)>,
    pub failed: Vec<(u64, RoundupError)>,
}

impl RoundupReport {
    pub fn summary(&self) -> String {
        format!("{} imported, {} failed", self.pushed.len(), self.failed.len())
    }
}

/// Imports `records` in ascending source id order.
///
/// A record the tracker rejects is reported and the import moves on; a
/// failure to write the timestamp index stops it.
pub async fn push_all<T, S>(
    tracker: &T,
    source: &S,
    records: &[SourceRecord],
    members: &[Member],
    writer: &mut TimestampWriter,
) -> Result<RoundupReport>
where
    T: RoundupTracker + ?Sized,
    S: TrackerSource + ?Sized,
{
    let mut ordered: Vec<&SourceRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.id);

    let directory = build_directory(tracker, members, &ordered).await?;
    let mut report = RoundupReport::default();
    for record in ordered {
        match push_record(tracker, source, record, &directory, writer).await {
            Ok(issue_id) => {
                log::info!("source {} -> issue{issue_id}", record.id);
                report.pushed.push((record.id, issue_id));
            }
            Err(err @ RoundupError::Storage(_)) => return Err(err),
            Err(err) => {
                log::error!("source {} failed: {err}", record.id);
                report.failed.push((record.id, err));
            }
        }
    }
    writer.flush()?;
    log::info!("import finished: {}", report.summary());
    Ok(report)
}
