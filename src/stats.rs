use crate::config;
use crate::models::SourceKind;
use crate::registry::{MANAGED_NODE_TYPES, MANAGED_RELATIONSHIP_TYPES};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counters for one source file, shared between the reader thread and the
/// async consumer.
#[derive(Default)]
pub struct SourceStats {
    pub records_read: AtomicU64,
    pub malformed: AtomicU64,
    pub rejected: AtomicU64,
    pub duplicates: AtomicU64,
    pub beyond_limit: AtomicU64,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self, count: u64) {
        self.records_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_malformed(&self, count: u64) {
        self.malformed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_beyond_limit(&self) {
        self.beyond_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.records_read.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn beyond_limit(&self) -> u64 {
        self.beyond_limit.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            read: self.read(),
            malformed: self.malformed(),
            rejected: self.rejected(),
            duplicates: self.duplicates(),
            beyond_limit: self.beyond_limit(),
        }
    }
}

/// Counters for one write target (a label or a relationship type).
#[derive(Default)]
pub struct WriteStats {
    pub rows_written: AtomicU64,
    pub rows_unmatched: AtomicU64,
    pub rows_failed: AtomicU64,
    pub retries: AtomicU64,
    failures: Mutex<Vec<String>>,
}

impl WriteStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_written(&self, count: u64) {
        self.rows_written.fetch_add(count, Ordering::Relaxed);
    }

    /// Relationship rows whose endpoints were not in the store.
    pub fn add_unmatched(&self, count: u64) {
        self.rows_unmatched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a rejected row and keeps its description for the summary,
    /// up to a fixed number per target.
    pub fn record_failure(&self, description: String) {
        self.rows_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut failures) = self.failures.lock() {
            if failures.len() < config::MAX_REPORTED_FAILURES {
                failures.push(description);
            }
        }
    }

    pub fn written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn unmatched(&self) -> u64 {
        self.rows_unmatched.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.rows_failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> WriteSnapshot {
        WriteSnapshot {
            written: self.written(),
            unmatched: self.unmatched(),
            failed: self.failed(),
            retried: self.retried(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    pub read: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub beyond_limit: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSnapshot {
    pub written: u64,
    pub unmatched: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Every counter of one ingest run, pre-registered for all sources and all
/// managed targets so lookups never allocate.
pub struct IngestStats {
    sources: FxHashMap<SourceKind, Arc<SourceStats>>,
    targets: FxHashMap<&'static str, Arc<WriteStats>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        let sources = SourceKind::ALL
            .iter()
            .map(|k| (*k, Arc::new(SourceStats::new())))
            .collect();
        let targets = MANAGED_NODE_TYPES
            .iter()
            .map(|n| n.label)
            .chain(MANAGED_RELATIONSHIP_TYPES.iter().map(|r| r.name))
            .map(|name| (name, Arc::new(WriteStats::new())))
            .collect();
        Self { sources, targets }
    }

    pub fn source(&self, kind: SourceKind) -> Arc<SourceStats> {
        self.sources
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(SourceStats::new()))
    }

    pub fn target(&self, name: &str) -> Arc<WriteStats> {
        self.targets
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(WriteStats::new()))
    }

    pub fn summary(&self) -> IngestSummary {
        let mut sources: Vec<_> = self
            .sources
            .iter()
            .map(|(k, s)| (*k, s.snapshot()))
            .collect();
        sources.sort_by_key(|(k, _)| *k);

        let mut targets: Vec<_> = self
            .targets
            .iter()
            .map(|(name, s)| (name.to_string(), s.snapshot()))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut failures: Vec<String> = Vec::new();
        for (name, stats) in &self.targets {
            failures.extend(stats.failures().into_iter().map(|f| format!("{name}: {f}")));
        }
        failures.sort();

        IngestSummary {
            sources,
            targets,
            failures,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub sources: Vec<(SourceKind, SourceSnapshot)>,
    pub targets: Vec<(String, WriteSnapshot)>,
    pub failures: Vec<String>,
}

impl IngestSummary {
    pub fn source(&self, kind: SourceKind) -> SourceSnapshot {
        self.sources
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }

    pub fn target(&self, name: &str) -> WriteSnapshot {
        self.targets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }

    pub fn total_failed(&self) -> u64 {
        self.targets.iter().map(|(_, s)| s.failed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_zero() {
        let stats = SourceStats::new();
        assert_eq!(stats.snapshot(), SourceSnapshot::default());
        let stats = WriteStats::new();
        assert_eq!(stats.snapshot(), WriteSnapshot::default());
    }

    #[test]
    fn source_counters() {
        let stats = SourceStats::new();
        stats.add_read(10);
        stats.add_malformed(2);
        stats.inc_rejected();
        stats.inc_duplicates();
        stats.inc_beyond_limit();
        stats.inc_beyond_limit();

        let snap = stats.snapshot();
        assert_eq!(snap.read, 10);
        assert_eq!(snap.malformed, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.beyond_limit, 2);
    }

    #[test]
    fn failures_are_capped() {
        let stats = WriteStats::new();
        for i in 0..(config::MAX_REPORTED_FAILURES + 5) {
            stats.record_failure(format!("row {i}"));
        }
        assert_eq!(stats.failed(), (config::MAX_REPORTED_FAILURES + 5) as u64);
        assert_eq!(stats.failures().len(), config::MAX_REPORTED_FAILURES);
    }

    #[test]
    fn ingest_stats_registers_managed_targets() {
        let stats = IngestStats::new();
        stats.target("Paper").add_written(3);
        stats.target("AUTHORED").add_unmatched(1);
        stats.target("AUTHORED").record_failure("bad row".into());
        stats.source(SourceKind::Papers).add_read(4);

        let summary = stats.summary();
        assert_eq!(summary.target("Paper").written, 3);
        assert_eq!(summary.target("AUTHORED").unmatched, 1);
        assert_eq!(summary.source(SourceKind::Papers).read, 4);
        assert_eq!(summary.total_failed(), 1);
        assert_eq!(summary.failures, vec!["AUTHORED: bad row".to_string()]);
        assert_eq!(summary.targets.len(), 9);
        assert_eq!(summary.sources.len(), 5);
    }

    #[test]
    fn unknown_target_is_detached() {
        let stats = IngestStats::new();
        stats.target("User").add_written(5);
        assert_eq!(stats.summary().target("User").written, 0);
    }
}
