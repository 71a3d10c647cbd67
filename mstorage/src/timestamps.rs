//! Append-only index of original creation / last-activity times.
//!
//! The push phase appends one `id;created;touched` line per record it creates
//! at the destination. The patch phase loads the files back and uses them to
//! restore the original times in the destination's flat export.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use crate::models::RecordCategory;

const FIELD_SEPARATOR: char = ';';

/// Original (created, touched) pair for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampPair {
    pub created: String,
    pub touched: String,
}

/// Renders a timestamp the way the flat export stores dates:
/// `(year, month, day, hour, minute, second, 0, 0, 0)`.
pub fn time_tuple(ts: &NaiveDateTime) -> String {
    format!(
        "({}, {}, {}, {}, {}, {}, 0, 0, 0)",
        ts.year(),
        ts.month(),
        ts.day(),
        ts.hour(),
        ts.minute(),
        ts.second()
    )
}

/// Read-only view over one category's index file.
#[derive(Debug, Default, Clone)]
pub struct TimestampIndex {
    entries: HashMap<String, TimestampPair>,
}

impl TimestampIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an index file. A missing file yields an empty index; later lines
    /// override earlier ones for the same id, so re-runs of the push phase
    /// simply win.
    pub fn load(path: &Path) -> Result<Self> {
        let mut index = Self::new();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(err) => return Err(err.into()),
        };

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, FIELD_SEPARATOR);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(created), Some(touched)) => {
                    index.insert(id, created, touched);
                }
                _ => {
                    return Err(StorageError::Malformed {
                        file: path.display().to_string(),
                        line: line_no + 1,
                        reason: "expected id;created;touched".to_string(),
                    })
                }
            }
        }
        Ok(index)
    }

    pub fn insert(&mut self, id: &str, created: &str, touched: &str) {
        self.entries.insert(
            id.to_string(),
            TimestampPair {
                created: created.to_string(),
                touched: touched.to_string(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&TimestampPair> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Appends entries to the three per-category index files.
pub struct TimestampWriter {
    dir: PathBuf,
    writers: HashMap<RecordCategory, BufWriter<File>>,
}

impl TimestampWriter {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.index_path)?;
        Ok(Self {
            dir: config.index_path.clone(),
            writers: HashMap::new(),
        })
    }

    fn writer(&mut self, category: RecordCategory) -> Result<&mut BufWriter<File>> {
        if !self.writers.contains_key(&category) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(category.index_file_name()))?;
            self.writers.insert(category, BufWriter::new(file));
        }
        self.writers
            .get_mut(&category)
            .ok_or_else(|| StorageError::NotFound(category.index_file_name().to_string()))
    }

    pub fn append(
        &mut self,
        category: RecordCategory,
        id: &str,
        created: &str,
        touched: &str,
    ) -> Result<()> {
        if id.contains(FIELD_SEPARATOR) || id.contains('\n') {
            return Err(StorageError::InvalidArg(format!(
                "index id '{id}' contains a reserved character"
            )));
        }
        let writer = self.writer(category)?;
        writeln!(writer, "{id}{FIELD_SEPARATOR}{created}{FIELD_SEPARATOR}{touched}")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for TimestampWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("failed to flush timestamp index: {err}");
        }
    }
}

/// Loads the index of one category from the configured index directory.
pub fn load_category(config: &StorageConfig, category: RecordCategory) -> Result<TimestampIndex> {
    TimestampIndex::load(&config.index_path.join(category.index_file_name()))
}
