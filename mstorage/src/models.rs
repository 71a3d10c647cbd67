use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::StorageError;

/// Lifecycle of one migrated record at the destination.
///
/// States only move forward; the catalog refuses to regress a record so a
/// re-run of an earlier phase does not hide work already done by a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Absent,
    Created,
    Populated,
    Linked,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Absent => "absent",
            RecordState::Created => "created",
            RecordState::Populated => "populated",
            RecordState::Linked => "linked",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(RecordState::Absent),
            "created" => Ok(RecordState::Created),
            "populated" => Ok(RecordState::Populated),
            "linked" => Ok(RecordState::Linked),
            other => Err(StorageError::InvalidArg(format!(
                "unknown record state '{other}'"
            ))),
        }
    }
}

// --- Metadata Catalog (SQLite) Models ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordProgress {
    pub source_id: u64,
    pub destination_id: u64,
    pub state: RecordState,
    pub updated_at: i64, // Unix timestamp
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBudget {
    pub api_endpoint: String,
    pub requests_left: i64,
    pub reset_time: i64, // Unix timestamp
}

/// The three kinds of exported records whose timestamps are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordCategory {
    Issue,
    Message,
    File,
}

impl RecordCategory {
    pub const ALL: [RecordCategory; 3] = [
        RecordCategory::Issue,
        RecordCategory::Message,
        RecordCategory::File,
    ];

    /// Name of the append-only timestamp index file for this category.
    pub fn index_file_name(&self) -> &'static str {
        match self {
            RecordCategory::Issue => "issue_dates.csv",
            RecordCategory::Message => "msg_dates.csv",
            RecordCategory::File => "file_dates.csv",
        }
    }

    /// Name of the flat export file the destination produces for this category.
    pub fn export_file_name(&self) -> &'static str {
        match self {
            RecordCategory::Issue => "issue.csv",
            RecordCategory::Message => "msg.csv",
            RecordCategory::File => "file.csv",
        }
    }
}
