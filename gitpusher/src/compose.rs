//! Rendering of a source record into destination issue fields.
//!
//! Everything here is a pure function of the record (plus the id map and
//! attachment links), so re-running a phase always produces the same body.

use tigrisfetcher::models::{
    format_timestamp, Attachment, IssueType, Resolution, SourceRecord,
};

use crate::client::{IssuePatch, IssueState};
use crate::mapper::ReconciliationMap;

const NO_MILESTONE: &str = "-unspecified-";
const ANONYMOUS: &str = "An anonymous user";

/// Field values that are the project default and therefore not labelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDefaults {
    pub component: String,
    pub subcomponent: String,
    pub version: String,
    pub platform: String,
    pub op_sys: String,
}

impl Default for LabelDefaults {
    fn default() -> Self {
        Self {
            component: "scons".to_string(),
            subcomponent: "scons".to_string(),
            version: "-unspecified-".to_string(),
            platform: "All".to_string(),
            op_sys: "All".to_string(),
        }
    }
}

pub fn issue_state(record: &SourceRecord) -> IssueState {
    if record.status.is_closed() {
        IssueState::Closed
    } else {
        IssueState::Open
    }
}

pub fn milestone_title(record: &SourceRecord) -> Option<&str> {
    record
        .target_milestone
        .as_deref()
        .filter(|title| *title != NO_MILESTONE)
}

fn resolution_label(resolution: Resolution) -> Option<&'static str> {
    match resolution {
        Resolution::Duplicate => Some("duplicate"),
        Resolution::Invalid => Some("invalid"),
        Resolution::WontFix => Some("wontfix"),
        _ => None,
    }
}

fn type_label(issue_type: IssueType) -> Option<&'static str> {
    match issue_type {
        IssueType::Defect => Some("bug"),
        IssueType::Enhancement => Some("enhancement"),
        _ => None,
    }
}

/// The complete label set of the record; it replaces whatever the
/// destination issue carries.
pub fn labels(record: &SourceRecord, defaults: &LabelDefaults) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut push = |label: String| {
        if !labels.contains(&label) {
            labels.push(label);
        }
    };

    if let Some(priority) = record.priority {
        push(format!("Priority: {priority}"));
    }
    if let Some(label) = record.resolution.and_then(resolution_label) {
        push(label.to_string());
    }
    for (name, value, default) in [
        ("Component", &record.component, &defaults.component),
        ("Version", &record.version, &defaults.version),
        ("Rep Platform", &record.platform, &defaults.platform),
        ("Subcomponent", &record.subcomponent, &defaults.subcomponent),
    ] {
        if let Some(value) = value.as_deref().filter(|v| *v != default.as_str()) {
            push(format!("{name}: {value}"));
        }
    }
    if let Some(label) = type_label(record.issue_type) {
        push(label.to_string());
    }
    if let Some(value) = record
        .op_sys
        .as_deref()
        .filter(|v| *v != defaults.op_sys.as_str())
    {
        push(format!("Op Sys: {value}"));
    }
    for keyword in &record.keywords {
        push(keyword.clone());
    }
    labels
}

fn quote(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    format!(">{}", normalized.trim_end().replace('\n', "\r\n>"))
}

/// Body of the destination issue, without relationship notes.
pub fn issue_body<F>(record: &SourceRecord, link_for: F) -> String
where
    F: Fn(&Attachment) -> String,
{
    let mut body = format!(
        "This issue was originally created at: {}.\r\n",
        format_timestamp(&record.created_at)
    );
    if let Some(reporter) = &record.reporter {
        body.push_str(&format!("This issue was reported by: `{reporter}`.\r\n"));
    }

    for comment in &record.comments {
        body.push_str(&format!(
            "{} said at {}\r\n{}\r\n\r\n",
            comment.author,
            format_timestamp(&comment.created_at),
            quote(&comment.text)
        ));
    }

    if let Some(location) = &record.file_location {
        body.push_str(&format!(
            "\r\nMore information about this issue is at {location}.\r\n"
        ));
    }
    if let Some(votes) = &record.votes {
        body.push_str(&format!("\r\nVotes for this issue: {votes}.\r\n"));
    }

    for attachment in &record.attachments {
        body.push_str(&format!(
            "\r\n{} attached [{}]({}) at {}.\r\n",
            attachment.submitter.as_deref().unwrap_or(ANONYMOUS),
            attachment.filename,
            link_for(attachment),
            format_timestamp(&attachment.created_at)
        ));
        if let Some(description) = &attachment.description {
            body.push_str(&format!("{}\r\n", quote(description)));
        }
    }
    body
}

/// One note per relationship edge, ordered by edge timestamp.
///
/// Edges without a target are dropped. Targets the map does not know are
/// written as given.
pub fn relationship_notes(record: &SourceRecord, map: &ReconciliationMap) -> String {
    let mut edges: Vec<_> = record
        .relationships
        .iter()
        .filter(|edge| !edge.target.trim().is_empty())
        .collect();
    edges.sort_by_key(|edge| edge.created_at);

    let mut notes = String::new();
    for edge in edges {
        let target = match edge.target_id().and_then(|id| map.get(id)) {
            Some(number) => number.to_string(),
            None => {
                log::warn!(
                    "issue {}: {} target '{}' is not in the id map, keeping it verbatim",
                    record.id,
                    edge.kind,
                    edge.target
                );
                edge.target.trim().to_string()
            }
        };
        notes.push_str(&format!(
            "\r\n{} said this issue {} #{} at {}.\r\n",
            edge.author,
            edge.kind.verb(),
            target,
            format_timestamp(&edge.created_at)
        ));
    }
    notes
}

/// The single update applied by the push phase.
pub fn full_patch(
    record: &SourceRecord,
    body: String,
    defaults: &LabelDefaults,
    milestone: Option<u64>,
) -> IssuePatch {
    IssuePatch {
        title: Some(record.title.clone()),
        body: Some(body),
        state: Some(issue_state(record)),
        labels: Some(labels(record, defaults)),
        milestone,
    }
}
