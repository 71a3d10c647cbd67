//! Positional repair of timestamp columns in flat export files.
//!
//! Bulk import stamps every record with the time of the import. The patcher
//! splices the original times back in, touching only the bytes of the two
//! timestamp columns. Free-text columns may contain the delimiter inside
//! quoted content, so lines are never split and re-joined as a whole.

use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use crate::models::RecordCategory;
use crate::timestamps::{self, TimestampIndex};

/// Column positions of one record type in the flat export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchColumns {
    pub id: usize,
    pub created: usize,
    pub touched: usize,
}

impl PatchColumns {
    pub const FILE: PatchColumns = PatchColumns {
        id: 4,
        created: 2,
        touched: 0,
    };
    pub const ISSUE: PatchColumns = PatchColumns {
        id: 6,
        created: 3,
        touched: 0,
    };
    pub const MESSAGE: PatchColumns = PatchColumns {
        id: 7,
        created: 3,
        touched: 0,
    };

    pub fn new(id: usize, created: usize, touched: usize) -> Result<Self> {
        if created == touched || id == created || id == touched {
            return Err(StorageError::InvalidArg(format!(
                "patch columns must be distinct (id={id}, created={created}, touched={touched})"
            )));
        }
        Ok(Self {
            id,
            created,
            touched,
        })
    }

    pub fn for_category(category: RecordCategory) -> Self {
        match category {
            RecordCategory::Issue => Self::ISSUE,
            RecordCategory::Message => Self::MESSAGE,
            RecordCategory::File => Self::FILE,
        }
    }

    fn widest(&self) -> usize {
        self.id.max(self.created).max(self.touched)
    }
}

/// Delimiter and quoting conventions of the flat export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatFileFormat {
    pub delimiter: u8,
    /// Quote character that shields delimiters inside a field.
    pub quote: Option<u8>,
}

impl Default for FlatFileFormat {
    fn default() -> Self {
        Self {
            delimiter: b':',
            quote: Some(b'"'),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub lines: usize,
    pub patched: usize,
    pub unmatched: usize,
}

/// Byte ranges of every field in `line`, honouring the quote character.
fn field_spans(line: &[u8], format: &FlatFileFormat) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (pos, &byte) in line.iter().enumerate() {
        if Some(byte) == format.quote {
            in_quotes = !in_quotes;
        } else if byte == format.delimiter && !in_quotes {
            spans.push(start..pos);
            start = pos + 1;
        }
    }
    spans.push(start..line.len());
    spans
}

fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    if let Some(body) = line.strip_suffix(b"\r\n") {
        (body, &line[body.len()..])
    } else if let Some(body) = line.strip_suffix(b"\n") {
        (body, &line[body.len()..])
    } else {
        (line, &[])
    }
}

fn strip_id_quotes(raw: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(raw).ok()?;
    Some(text.trim().trim_matches(|c| c == '\'' || c == '"'))
}

enum LineOutcome {
    Patched(Vec<u8>),
    Unmatched,
    NotData,
}

fn patch_line(
    body: &[u8],
    index: &TimestampIndex,
    columns: &PatchColumns,
    format: &FlatFileFormat,
) -> LineOutcome {
    let spans = field_spans(body, format);
    if spans.len() <= 1 {
        return LineOutcome::NotData;
    }
    if columns.widest() >= spans.len() {
        log::warn!(
            "line has {} fields, column {} requested; leaving it untouched",
            spans.len(),
            columns.widest()
        );
        return LineOutcome::NotData;
    }

    let Some(id) = strip_id_quotes(&body[spans[columns.id].clone()]) else {
        return LineOutcome::Unmatched;
    };
    let Some(pair) = index.get(id) else {
        return LineOutcome::Unmatched;
    };

    let mut replacements = [
        (spans[columns.created].clone(), pair.created.as_bytes()),
        (spans[columns.touched].clone(), pair.touched.as_bytes()),
    ];
    replacements.sort_by_key(|(span, _)| span.start);

    let mut out = Vec::with_capacity(body.len() + 32);
    let mut cursor = 0;
    for (span, value) in replacements {
        out.extend_from_slice(&body[cursor..span.start]);
        out.extend_from_slice(value);
        cursor = span.end;
    }
    out.extend_from_slice(&body[cursor..]);
    LineOutcome::Patched(out)
}

/// Patches an in-memory copy of a flat export. The first line is the header
/// and always passes through.
pub fn patch_bytes(
    content: &[u8],
    index: &TimestampIndex,
    columns: &PatchColumns,
    format: &FlatFileFormat,
) -> (Vec<u8>, PatchReport) {
    let mut out = Vec::with_capacity(content.len());
    let mut report = PatchReport::default();

    for (line_no, raw) in content.split_inclusive(|&b| b == b'\n').enumerate() {
        report.lines += 1;
        if line_no == 0 {
            out.extend_from_slice(raw);
            continue;
        }

        let (body, terminator) = split_terminator(raw);
        match patch_line(body, index, columns, format) {
            LineOutcome::Patched(patched) => {
                out.extend_from_slice(&patched);
                out.extend_from_slice(terminator);
                report.patched += 1;
            }
            LineOutcome::Unmatched => {
                out.extend_from_slice(raw);
                report.unmatched += 1;
            }
            LineOutcome::NotData => out.extend_from_slice(raw),
        }
    }

    (out, report)
}

/// Patches `path` in place. The rewritten content is assembled in memory and
/// swapped in through a temporary file in the same directory.
pub fn patch_file(
    path: &Path,
    index: &TimestampIndex,
    columns: &PatchColumns,
    format: &FlatFileFormat,
) -> Result<PatchReport> {
    let content = std::fs::read(path)?;
    let (patched, report) = patch_bytes(&content, index, columns, format);

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let permissions = std::fs::metadata(path)?.permissions();
    let mut staging = NamedTempFile::new_in(&dir)?;
    staging.write_all(&patched)?;
    staging.as_file().set_permissions(permissions)?;
    staging.as_file().sync_all()?;
    staging.persist(path)?;

    log::info!(
        "patched {}: {} of {} lines updated, {} without recorded times",
        path.display(),
        report.patched,
        report.lines,
        report.unmatched
    );
    Ok(report)
}

/// Patches `file.csv`, `issue.csv` and `msg.csv` in `export_dir` using the
/// recorded index files. Missing export files are skipped.
pub fn patch_export_dir(
    export_dir: &Path,
    config: &StorageConfig,
    format: &FlatFileFormat,
) -> Result<Vec<(RecordCategory, PatchReport)>> {
    let mut reports = Vec::new();
    for category in RecordCategory::ALL {
        let index = timestamps::load_category(config, category)?;
        let path = export_dir.join(category.export_file_name());
        if !path.exists() {
            log::warn!("{} not found, skipping", path.display());
            continue;
        }
        log::info!(
            "{} recorded times for {}",
            index.len(),
            category.export_file_name()
        );
        let report = patch_file(&path, &index, &PatchColumns::for_category(category), format)?;
        reports.push((category, report));
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn index() -> TimestampIndex {
        let mut index = TimestampIndex::new();
        index.insert(
            "12",
            "(2001, 5, 6, 7, 8, 9, 0, 0, 0)",
            "(2003, 1, 2, 3, 4, 5, 0, 0, 0)",
        );
        index
    }

    const MSG_COLUMNS: PatchColumns = PatchColumns::MESSAGE;

    fn plain() -> FlatFileFormat {
        FlatFileFormat::default()
    }

    #[test]
    fn test_only_timestamp_columns_change() {
        let header = b"activity:actor:author:creation:creator:date:files:id:content\n";
        let line = b"NOW:'1':'3':NOW:'1':'x':[]:'12':\"he said: hi: there\"\n";
        let mut content = header.to_vec();
        content.extend_from_slice(line);

        let (out, report) = patch_bytes(&content, &index(), &MSG_COLUMNS, &plain());
        let out = String::from_utf8(out).unwrap();
        let mut lines = out.lines();

        assert_eq!(lines.next().unwrap().as_bytes(), &header[..header.len() - 1]);
        assert_eq!(
            lines.next().unwrap(),
            "(2003, 1, 2, 3, 4, 5, 0, 0, 0):'1':'3':(2001, 5, 6, 7, 8, 9, 0, 0, 0):'1':'x':[]:'12':\"he said: hi: there\""
        );
        assert_eq!(report.patched, 1);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_free_text_bytes_survive_exactly() {
        let text = "\"quoted: with ::: delimiters and 'apostrophes' \u{e9}\"";
        let line = format!("T:'1':'3':C:'1':'x':[]:'12':{text}:tail\r\n");
        let content = format!("header\n{line}");

        let (out, _) = patch_bytes(content.as_bytes(), &index(), &MSG_COLUMNS, &plain());
        let out = String::from_utf8(out).unwrap();
        let patched = out.lines().nth(1).unwrap();

        assert!(patched.ends_with(&format!("{text}:tail")));
        assert!(out.ends_with("\r\n"));
    }

    #[test]
    fn test_unmatched_and_short_lines_pass_through() {
        let content = b"header\nT:'1':'3':C:'1':'x':[]:'99':body\nsingle-field\n\nT:'1'\n";
        let (out, report) = patch_bytes(content, &index(), &MSG_COLUMNS, &plain());

        assert_eq!(out, content.to_vec());
        assert_eq!(report.patched, 0);
        assert_eq!(report.unmatched, 1);
    }

    #[test]
    fn test_header_is_never_patched() {
        let content = b"T:'1':'3':C:'1':'x':[]:'12':body";
        let (out, _) = patch_bytes(content, &index(), &MSG_COLUMNS, &plain());
        assert_eq!(out, content.to_vec());
    }

    #[test]
    fn test_patch_file_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issue.csv");
        std::fs::write(&path, "h\nT:a:b:C:d:e:'12':f\nT:a:b:C:d:e:'13':f").unwrap();

        let report = patch_file(&path, &index(), &PatchColumns::ISSUE, &plain()).unwrap();
        assert_eq!(report.patched, 1);

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "h\n(2003, 1, 2, 3, 4, 5, 0, 0, 0):a:b:(2001, 5, 6, 7, 8, 9, 0, 0, 0):d:e:'12':f\nT:a:b:C:d:e:'13':f"
        );
        // No stray temporary files are left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_patch_file_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("msg.csv");
        std::fs::write(&path, "h\nT:'1':'3':C:'1':'x':[]:'12':body\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        patch_file(&path, &index(), &MSG_COLUMNS, &plain()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_columns_must_be_distinct() {
        assert!(PatchColumns::new(1, 2, 2).is_err());
        assert!(PatchColumns::new(4, 2, 0).is_ok());
    }
}
