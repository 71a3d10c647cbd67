use chrono::NaiveDateTime;
use std::fmt;

/// Timestamp layout used throughout the Issuezilla export.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M"))
        .ok()
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary!(IssueStatus {
    Unconfirmed => "UNCONFIRMED",
    New => "NEW",
    Started => "STARTED",
    Reopened => "REOPENED",
    Resolved => "RESOLVED",
    Verified => "VERIFIED",
    Closed => "CLOSED",
});

impl IssueStatus {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            IssueStatus::Resolved | IssueStatus::Verified | IssueStatus::Closed
        )
    }
}

vocabulary!(Resolution {
    Fixed => "FIXED",
    Invalid => "INVALID",
    WontFix => "WONTFIX",
    Later => "LATER",
    Remind => "REMIND",
    Duplicate => "DUPLICATE",
    WorksForMe => "WORKSFORME",
});

vocabulary!(IssueType {
    Defect => "DEFECT",
    Enhancement => "ENHANCEMENT",
    Feature => "FEATURE",
    Task => "TASK",
    Patch => "PATCH",
});

vocabulary!(Priority {
    P1 => "P1",
    P2 => "P2",
    P3 => "P3",
    P4 => "P4",
    P5 => "P5",
});

vocabulary!(
    /// Typed edge between two source records.
    RelationKind {
        DependsOn => "dependson",
        Blocks => "blocks",
        DuplicateOf => "is_duplicate",
        DuplicatedBy => "has_duplicates",
    }
);

impl RelationKind {
    pub fn verb(&self) -> &'static str {
        match self {
            RelationKind::DependsOn => "depends on",
            RelationKind::Blocks => "blocks",
            RelationKind::DuplicateOf => "is a duplicate of",
            RelationKind::DuplicatedBy => "is duplicated by",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    pub created_at: NaiveDateTime,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentPayload {
    /// Base64 content embedded in the export.
    Inline(String),
    /// Download location on the source tracker.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub attach_id: String,
    pub filename: String,
    pub submitter: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub created_at: NaiveDateTime,
    pub payload: Option<AttachmentPayload>,
}

impl Attachment {
    /// Stable location of the attachment in a content store.
    pub fn content_path(&self) -> String {
        format!("{}/{}", self.attach_id, self.filename)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub kind: RelationKind,
    pub author: String,
    pub created_at: NaiveDateTime,
    /// Raw target reference; may be empty in malformed exports.
    pub target: String,
}

impl Relationship {
    pub fn target_id(&self) -> Option<u64> {
        self.target.trim().parse().ok()
    }
}

/// One issue as exported by the source tracker. Comments, attachments and
/// relationships are ordered by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub id: u64,
    pub status: IssueStatus,
    pub resolution: Option<Resolution>,
    pub issue_type: IssueType,
    pub priority: Option<Priority>,
    pub title: String,
    pub reporter: Option<String>,
    pub assignee: Option<String>,
    pub component: Option<String>,
    pub subcomponent: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub op_sys: Option<String>,
    pub target_milestone: Option<String>,
    pub keywords: Vec<String>,
    pub file_location: Option<String>,
    pub votes: Option<String>,
    pub created_at: NaiveDateTime,
    pub last_activity: NaiveDateTime,
    pub comments: Vec<Comment>,
    pub attachments: Vec<Attachment>,
    pub relationships: Vec<Relationship>,
}
