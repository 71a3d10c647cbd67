//! Decoding of Issuezilla XML exports into [`SourceRecord`]s.
//!
//! The wire structs are deliberately lenient (every field optional) so one
//! malformed issue is rejected on its own during conversion instead of
//! failing the whole batch.

use std::borrow::Cow;

use serde::Deserialize;

use crate::error::{FetchError, Result};
use crate::models::{
    parse_timestamp, Attachment, AttachmentPayload, Comment, IssueStatus, IssueType, Priority,
    RelationKind, Relationship, Resolution, SourceRecord,
};

const MISSING_STATUS_CODE: &str = "404";

#[derive(Debug, Deserialize, Default)]
struct IssuezillaDoc {
    #[serde(rename = "issue", default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawIssue {
    #[serde(rename = "@status_code")]
    status_code: Option<String>,
    issue_id: Option<String>,
    issue_status: Option<String>,
    priority: Option<String>,
    resolution: Option<String>,
    component: Option<String>,
    version: Option<String>,
    rep_platform: Option<String>,
    assigned_to: Option<String>,
    delta_ts: Option<String>,
    subcomponent: Option<String>,
    reporter: Option<String>,
    target_milestone: Option<String>,
    issue_type: Option<String>,
    creation_ts: Option<String>,
    op_sys: Option<String>,
    short_desc: Option<String>,
    issue_file_loc: Option<String>,
    votes: Option<String>,
    keywords: Vec<String>,
    long_desc: Vec<RawComment>,
    attachment: Vec<RawAttachment>,
    dependson: Vec<RawRelation>,
    blocks: Vec<RawRelation>,
    is_duplicate: Vec<RawRelation>,
    has_duplicates: Vec<RawRelation>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawComment {
    who: Option<String>,
    issue_when: Option<String>,
    thetext: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawAttachment {
    attachid: Option<String>,
    date: Option<String>,
    desc: Option<String>,
    filename: Option<String>,
    mimetype: Option<String>,
    submitting_username: Option<String>,
    data: Option<String>,
    attachment_iz_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawRelation {
    who: Option<String>,
    when: Option<String>,
    issue_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeDoc {
    #[serde(rename = "issue", default)]
    issues: Vec<ProbeIssue>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeIssue {
    #[serde(rename = "@status_code", default)]
    status_code: Option<String>,
}

/// Result of decoding one export document.
#[derive(Debug, Default)]
pub struct ParsedExport {
    pub records: Vec<SourceRecord>,
    /// Ids the source reported as absent (`status_code="404"` placeholders).
    pub missing: Vec<String>,
    /// Issues that could not be converted; the rest of the batch is unaffected.
    pub rejected: Vec<FetchError>,
}

fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Undoes the extra level of entity escaping the exporter applies to free text.
fn unescape_text(raw: &str) -> String {
    match quick_xml::escape::unescape(raw) {
        Ok(text) => text.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Whether a single-issue existence query reported the issue as present.
pub fn issue_present(bytes: &[u8]) -> Result<bool> {
    let doc: ProbeDoc = quick_xml::de::from_str(&decode_text(bytes))?;
    Ok(match doc.issues.first() {
        Some(issue) => issue.status_code.as_deref() != Some(MISSING_STATUS_CODE),
        None => false,
    })
}

/// Decodes a bulk export. Records come back ordered by id.
pub fn parse_export(bytes: &[u8]) -> Result<ParsedExport> {
    let doc: IssuezillaDoc = quick_xml::de::from_str(&decode_text(bytes))?;
    let mut parsed = ParsedExport::default();

    for raw in doc.issues {
        if raw.status_code.as_deref() == Some(MISSING_STATUS_CODE) {
            parsed
                .missing
                .push(raw.issue_id.clone().unwrap_or_default());
            continue;
        }
        match convert_issue(raw) {
            Ok(record) => parsed.records.push(record),
            Err(err) => {
                log::warn!("skipping issue: {err}");
                parsed.rejected.push(err);
            }
        }
    }

    parsed.records.sort_by_key(|r| r.id);
    Ok(parsed)
}

fn convert_issue(raw: RawIssue) -> Result<SourceRecord> {
    let id_text = non_empty(raw.issue_id).unwrap_or_default();
    let invalid = |reason: String| FetchError::InvalidRecord {
        id: id_text.clone(),
        reason,
    };

    let id: u64 = id_text
        .parse()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| invalid("issue_id is not a positive integer".to_string()))?;

    let status_text = non_empty(raw.issue_status).unwrap_or_default();
    let status = IssueStatus::parse(&status_text)
        .ok_or_else(|| invalid(format!("unknown issue_status '{status_text}'")))?;

    let resolution = match non_empty(raw.resolution) {
        Some(text) => Some(
            Resolution::parse(&text)
                .ok_or_else(|| invalid(format!("unknown resolution '{text}'")))?,
        ),
        None => None,
    };

    let type_text = non_empty(raw.issue_type).unwrap_or_default();
    let issue_type = IssueType::parse(&type_text)
        .ok_or_else(|| invalid(format!("unknown issue_type '{type_text}'")))?;

    let priority = match non_empty(raw.priority) {
        Some(text) => Some(
            Priority::parse(&text).ok_or_else(|| invalid(format!("unknown priority '{text}'")))?,
        ),
        None => None,
    };

    let created_at = non_empty(raw.creation_ts)
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| invalid("missing or malformed creation_ts".to_string()))?;
    let last_activity = non_empty(raw.delta_ts)
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(created_at);

    let mut comments = Vec::with_capacity(raw.long_desc.len());
    for desc in raw.long_desc {
        let when = non_empty(desc.issue_when).unwrap_or_default();
        let created_at = parse_timestamp(&when)
            .ok_or_else(|| invalid(format!("comment has malformed issue_when '{when}'")))?;
        comments.push(Comment {
            author: non_empty(desc.who).unwrap_or_else(|| "An anonymous user".to_string()),
            created_at,
            text: unescape_text(desc.thetext.as_deref().unwrap_or_default()),
        });
    }
    comments.sort_by_key(|c| c.created_at);

    let mut attachments = Vec::with_capacity(raw.attachment.len());
    for att in raw.attachment {
        let attach_id = non_empty(att.attachid)
            .ok_or_else(|| invalid("attachment without attachid".to_string()))?;
        let date = non_empty(att.date).unwrap_or_default();
        let created_at = parse_timestamp(&date).ok_or_else(|| {
            invalid(format!("attachment {attach_id} has malformed date '{date}'"))
        })?;
        let payload = match (non_empty(att.data), non_empty(att.attachment_iz_url)) {
            (Some(data), _) => Some(AttachmentPayload::Inline(data)),
            (None, Some(url)) => Some(AttachmentPayload::Remote(url)),
            (None, None) => None,
        };
        attachments.push(Attachment {
            filename: non_empty(att.filename).unwrap_or_else(|| format!("attachment-{attach_id}")),
            attach_id,
            submitter: non_empty(att.submitting_username),
            description: non_empty(att.desc).map(|d| unescape_text(&d)),
            mime_type: non_empty(att.mimetype),
            created_at,
            payload,
        });
    }
    attachments.sort_by_key(|a| a.created_at);

    let mut relationships = Vec::new();
    for (kind, edges) in [
        (RelationKind::DependsOn, raw.dependson),
        (RelationKind::Blocks, raw.blocks),
        (RelationKind::DuplicateOf, raw.is_duplicate),
        (RelationKind::DuplicatedBy, raw.has_duplicates),
    ] {
        for edge in edges {
            let when = non_empty(edge.when).unwrap_or_default();
            let created_at = parse_timestamp(&when).ok_or_else(|| {
                invalid(format!("{kind} edge has malformed timestamp '{when}'"))
            })?;
            relationships.push(Relationship {
                kind,
                author: non_empty(edge.who).unwrap_or_else(|| "An anonymous user".to_string()),
                created_at,
                target: non_empty(edge.issue_id).unwrap_or_default(),
            });
        }
    }
    relationships.sort_by_key(|r| r.created_at);

    let keywords = raw
        .keywords
        .iter()
        .flat_map(|field| field.split(','))
        .map(str::trim)
        .filter(|kw| !kw.is_empty())
        .map(str::to_string)
        .collect();

    Ok(SourceRecord {
        id,
        status,
        resolution,
        issue_type,
        priority,
        title: unescape_text(&non_empty(raw.short_desc).unwrap_or_default()),
        reporter: non_empty(raw.reporter),
        assignee: non_empty(raw.assigned_to),
        component: non_empty(raw.component),
        subcomponent: non_empty(raw.subcomponent),
        version: non_empty(raw.version),
        platform: non_empty(raw.rep_platform),
        op_sys: non_empty(raw.op_sys),
        target_milestone: non_empty(raw.target_milestone),
        keywords,
        file_location: non_empty(raw.issue_file_loc),
        votes: non_empty(raw.votes),
        created_at,
        last_activity,
        comments,
        attachments,
        relationships,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format_timestamp;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE issuezilla SYSTEM "issuezilla.dtd">
<issuezilla>
  <issue status_code="200">
    <issue_id>2</issue_id>
    <issue_status>RESOLVED</issue_status>
    <priority>P2</priority>
    <resolution>FIXED</resolution>
    <component>scons</component>
    <version>-unspecified-</version>
    <rep_platform>All</rep_platform>
    <assigned_to>issues@scons</assigned_to>
    <delta_ts>2003-04-05 06:07:08</delta_ts>
    <subcomponent>scons</subcomponent>
    <reporter>stevenknight</reporter>
    <target_milestone>1.0</target_milestone>
    <issue_type>DEFECT</issue_type>
    <creation_ts>2001-09-25 13:14:15</creation_ts>
    <op_sys>All</op_sys>
    <short_desc>Build fails &amp;amp; nobody knows</short_desc>
    <keywords>windows, msvc</keywords>
    <long_desc>
      <who>bob</who>
      <issue_when>2001-09-26 10:00:00</issue_when>
      <thetext>second</thetext>
    </long_desc>
    <long_desc>
      <who>stevenknight</who>
      <issue_when>2001-09-25 13:14:15</issue_when>
      <thetext>first &amp;lt;b&amp;gt;</thetext>
    </long_desc>
    <dependson>
      <who>bob</who>
      <when>2002-01-01 00:00:00</when>
      <issue_id>1</issue_id>
    </dependson>
    <attachment>
      <attachid>17</attachid>
      <date>2001-09-27 00:00:00</date>
      <desc>log</desc>
      <filename>build.log</filename>
      <mimetype>text/plain</mimetype>
      <submitting_username>bob</submitting_username>
      <attachment_iz_url>http://scons.tigris.org/a/17</attachment_iz_url>
    </attachment>
    <blocks>
      <who>alice</who>
      <when>2001-12-31 00:00:00</when>
      <issue_id></issue_id>
    </blocks>
  </issue>
  <issue status_code="404">
    <issue_id>3</issue_id>
  </issue>
  <issue status_code="200">
    <issue_id>1</issue_id>
    <issue_status>BOGUS</issue_status>
  </issue>
</issuezilla>"#;

    #[test]
    fn test_parse_export_decodes_records() {
        let parsed = parse_export(SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.missing, vec!["3".to_string()]);
        assert_eq!(parsed.rejected.len(), 1);

        let record = &parsed.records[0];
        assert_eq!(record.id, 2);
        assert_eq!(record.status, IssueStatus::Resolved);
        assert_eq!(record.resolution, Some(Resolution::Fixed));
        assert_eq!(record.issue_type, IssueType::Defect);
        assert_eq!(record.priority, Some(Priority::P2));
        assert_eq!(record.title, "Build fails & nobody knows");
        assert_eq!(record.keywords, vec!["windows", "msvc"]);
        assert_eq!(format_timestamp(&record.last_activity), "2003-04-05 06:07:08");

        // Comments come back in timestamp order with the text unescaped.
        assert_eq!(record.comments[0].author, "stevenknight");
        assert_eq!(record.comments[0].text, "first <b>");
        assert_eq!(record.comments[1].text, "second");

        assert_eq!(record.attachments[0].content_path(), "17/build.log");
        assert_eq!(
            record.attachments[0].payload,
            Some(AttachmentPayload::Remote("http://scons.tigris.org/a/17".into()))
        );

        // Edges are ordered by timestamp across kinds; empty targets survive parsing.
        assert_eq!(record.relationships.len(), 2);
        assert_eq!(record.relationships[0].kind, RelationKind::Blocks);
        assert_eq!(record.relationships[0].target_id(), None);
        assert_eq!(record.relationships[1].target_id(), Some(1));
    }

    #[test]
    fn test_rejected_issue_reports_reason() {
        let parsed = parse_export(SAMPLE.as_bytes()).unwrap();
        match &parsed.rejected[0] {
            FetchError::InvalidRecord { id, reason } => {
                assert_eq!(id, "1");
                assert!(reason.contains("BOGUS"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_issue_present() {
        let present = r#"<issuezilla><issue status_code="200"><issue_id>5</issue_id></issue></issuezilla>"#;
        let missing = r#"<issuezilla><issue status_code="404"><issue_id>6</issue_id></issue></issuezilla>"#;
        let empty = r#"<issuezilla></issuezilla>"#;

        assert!(issue_present(present.as_bytes()).unwrap());
        assert!(!issue_present(missing.as_bytes()).unwrap());
        assert!(!issue_present(empty.as_bytes()).unwrap());
    }
}
