//! Quick look at a dump directory before loading it.

use crate::error::FormatError;
use crate::models::SourceKind;
use crate::normalize::normalize;
use crate::parser::{Compression, Layout, RecordStream};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct SourceInspection {
    pub kind: SourceKind,
    pub path: Option<PathBuf>,
    pub layout: Option<Layout>,
    pub compression: Option<Compression>,
    /// Records read from the head of the file.
    pub sampled: u64,
    pub malformed: u64,
    /// How many of the sampled records would be loaded.
    pub accepted: u64,
    pub fields: BTreeSet<String>,
    pub first_record: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl SourceInspection {
    fn missing(kind: SourceKind) -> Self {
        Self {
            kind,
            path: None,
            layout: None,
            compression: None,
            sampled: 0,
            malformed: 0,
            accepted: 0,
            fields: BTreeSet::new(),
            first_record: None,
            error: None,
        }
    }
}

/// Inspects every known dump file in `dir`, reading at most `sample` records
/// of each. Unreadable files are reported, not returned as errors.
pub fn inspect_dir(dir: &Path, sample: usize) -> Vec<SourceInspection> {
    SourceKind::ALL
        .iter()
        .map(|kind| match kind.locate(dir) {
            Some(path) => inspect_file(&path, *kind, sample).unwrap_or_else(|e| {
                let mut report = SourceInspection::missing(*kind);
                report.path = Some(path);
                report.error = Some(e.to_string());
                report
            }),
            None => SourceInspection::missing(*kind),
        })
        .collect()
}

pub fn inspect_file(
    path: &Path,
    kind: SourceKind,
    sample: usize,
) -> Result<SourceInspection, FormatError> {
    let mut stream = RecordStream::open(path, kind)?;
    let mut report = SourceInspection::missing(kind);
    report.path = Some(path.to_path_buf());

    for raw in stream.by_ref().take(sample) {
        report.fields.extend(raw.keys().cloned());
        if normalize(kind, &raw).is_ok() {
            report.accepted += 1;
        }
        if report.first_record.is_none() {
            report.first_record = Some(serde_json::Value::Object(raw));
        }
    }

    let summary = stream.summary();
    report.layout = Some(summary.layout);
    report.compression = Some(summary.compression);
    report.sampled = summary.records;
    report.malformed = summary.malformed;
    debug!(source = %kind, path = %path.display(), sampled = report.sampled, "Inspected source");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reports_present_and_missing_sources() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("datasets.json"),
            "{\"name\": \"MNIST\", \"paper_count\": 3}\n{\"full_name\": \"no id\"}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("methods.json"), "[{\"name\": \"Dropout\"}]").unwrap();

        let reports = inspect_dir(dir.path(), 10);
        assert_eq!(reports.len(), SourceKind::ALL.len());

        let datasets = reports.iter().find(|r| r.kind == SourceKind::Datasets).unwrap();
        assert_eq!(datasets.layout, Some(Layout::LineDelimited));
        assert_eq!(datasets.sampled, 2);
        assert_eq!(datasets.accepted, 1);
        assert!(datasets.fields.contains("paper_count"));

        let methods = reports.iter().find(|r| r.kind == SourceKind::Methods).unwrap();
        assert_eq!(methods.layout, Some(Layout::Array));
        assert_eq!(methods.accepted, 0);

        let papers = reports.iter().find(|r| r.kind == SourceKind::Papers).unwrap();
        assert!(papers.path.is_none());
    }

    #[test]
    fn unreadable_layout_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("papers-with-abstracts.json"), "not json").unwrap();
        let reports = inspect_dir(dir.path(), 5);
        let papers = reports.iter().find(|r| r.kind == SourceKind::Papers).unwrap();
        assert!(papers.path.is_some());
        assert!(papers.error.is_some());
    }
}
