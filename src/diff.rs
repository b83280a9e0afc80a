//! Read-only comparison of two graph stores.
//!
//! Counts are compared per label and relationship type. Nodes are then
//! sampled on both sides (the first N by key) and looked up on the other side
//! by key, property by property. `updated_at` is written by the store on every
//! merge and never compared.
//!
//! Nothing here fails: a query that errors is logged, recorded as a warning and
//! counted as zero, so an empty store that has never seen a label compares the
//! same as one that reports zero for it.

use crate::registry::{self, MANAGED_NODE_TYPES, MANAGED_RELATIONSHIP_TYPES};
use crate::store::GraphStore;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Properties set by the store itself rather than by the data.
const VOLATILE_PROPERTIES: [&str; 1] = ["updated_at"];

/// Keys tried, in order, to sample a label the registry does not know.
const FALLBACK_KEYS: [&str; 4] = ["id", "arxiv_id", "url", "name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DiffScope {
    /// Every label and relationship type either store reports.
    Full,
    /// Only the types this pipeline owns.
    ManagedOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    pub scope: DiffScope,
    pub sample_size: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            scope: DiffScope::ManagedOnly,
            sample_size: crate::config::DEFAULT_SAMPLE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountComparison {
    pub name: String,
    pub managed: bool,
    pub source: u64,
    pub target: u64,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMismatch {
    pub key: String,
    pub field: String,
    pub source: Value,
    pub target: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleComparison {
    pub label: String,
    pub key_property: Option<String>,
    pub sampled: usize,
    pub missing_in_target: Vec<String>,
    pub missing_in_source: Vec<String>,
    pub mismatches: Vec<FieldMismatch>,
}

impl SampleComparison {
    pub fn is_clean(&self) -> bool {
        self.missing_in_target.is_empty()
            && self.missing_in_source.is_empty()
            && self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub target: String,
    pub scope: DiffScope,
    pub sample_size: usize,
    pub node_counts: Vec<CountComparison>,
    pub relationship_counts: Vec<CountComparison>,
    pub samples: Vec<SampleComparison>,
    pub warnings: Vec<String>,
    pub identical: bool,
}

impl DiffReport {
    /// Count verdicts that differ plus sampled nodes that disagree.
    pub fn mismatch_count(&self) -> usize {
        let counts = self
            .node_counts
            .iter()
            .chain(&self.relationship_counts)
            .filter(|c| !c.matches)
            .count();
        let samples: usize = self
            .samples
            .iter()
            .map(|s| s.missing_in_target.len() + s.missing_in_source.len() + s.mismatches.len())
            .sum();
        counts + samples
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Graph Diff ===");
        let _ = writeln!(out, "Source: {}", self.source);
        let _ = writeln!(out, "Target: {}", self.target);
        let scope = match self.scope {
            DiffScope::Full => "full",
            DiffScope::ManagedOnly => "managed-only",
        };
        let _ = writeln!(out, "Scope:  {scope}");

        for (title, counts) in [
            ("Nodes", &self.node_counts),
            ("Relationships", &self.relationship_counts),
        ] {
            let _ = writeln!(out, "\n{title}:");
            if counts.is_empty() {
                let _ = writeln!(out, "  (none)");
            }
            for c in counts {
                let verdict = if c.matches { "ok" } else { "DIFFERENT" };
                let _ = writeln!(
                    out,
                    "  {:<28} {:>12} {:>12}  {verdict}",
                    c.name, c.source, c.target
                );
            }
        }

        let _ = writeln!(out, "\nSamples:");
        for s in &self.samples {
            let key = s.key_property.as_deref().unwrap_or("-");
            let _ = writeln!(
                out,
                "  {:<28} key={key} sampled={} missing_in_target={} missing_in_source={} field_mismatches={}",
                s.label,
                s.sampled,
                s.missing_in_target.len(),
                s.missing_in_source.len(),
                s.mismatches.len()
            );
            for m in s.mismatches.iter().take(5) {
                let _ = writeln!(
                    out,
                    "      {} .{}: {} != {}",
                    m.key, m.field, m.source, m.target
                );
            }
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  {w}");
            }
        }

        let verdict = if self.identical {
            "IDENTICAL".to_string()
        } else {
            format!("DIFFERENT ({} mismatches)", self.mismatch_count())
        };
        let _ = writeln!(out, "\nResult: {verdict}");
        out
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// One side of the comparison plus the warnings its failures produced.
struct Side<'a> {
    name: &'static str,
    store: &'a dyn GraphStore,
    uri: String,
}

impl Side<'_> {
    fn warn(&self, warnings: &mut Vec<String>, what: &str, error: impl std::fmt::Display) {
        warn!(side = self.name, store = %self.uri, what, error = %error, "Diff query failed");
        warnings.push(format!("{} ({}): {what}: {error}", self.name, self.uri));
    }

    async fn count_nodes(&self, label: &str, warnings: &mut Vec<String>) -> u64 {
        match self.store.count_nodes(label).await {
            Ok(n) => n,
            Err(e) => {
                self.warn(warnings, &format!("count of {label}"), e);
                0
            }
        }
    }

    async fn count_relationships(&self, rel_type: &str, warnings: &mut Vec<String>) -> u64 {
        match self.store.count_relationships(rel_type).await {
            Ok(n) => n,
            Err(e) => {
                self.warn(warnings, &format!("count of {rel_type}"), e);
                0
            }
        }
    }

    async fn names(&self, relationships: bool, warnings: &mut Vec<String>) -> Vec<String> {
        let result = if relationships {
            self.store.relationship_types().await
        } else {
            self.store.labels().await
        };
        result.unwrap_or_else(|e| {
            let what = if relationships { "relationship types" } else { "labels" };
            self.warn(warnings, what, e);
            Vec::new()
        })
    }

    async fn sample(
        &self,
        label: &str,
        key: &str,
        limit: usize,
        warnings: &mut Vec<String>,
    ) -> Vec<crate::models::PropertyMap> {
        self.store
            .sample_nodes(label, key, limit)
            .await
            .unwrap_or_else(|e| {
                self.warn(warnings, &format!("sample of {label}"), e);
                Vec::new()
            })
    }

    async fn fetch(
        &self,
        label: &str,
        key: &str,
        keys: &[Value],
        warnings: &mut Vec<String>,
    ) -> Vec<crate::models::PropertyMap> {
        if keys.is_empty() {
            return Vec::new();
        }
        self.store
            .fetch_nodes(label, key, keys)
            .await
            .unwrap_or_else(|e| {
                self.warn(warnings, &format!("lookup in {label}"), e);
                Vec::new()
            })
    }
}

/// Compares `source` with `target` without writing to either.
pub async fn compare(
    source: &dyn GraphStore,
    target: &dyn GraphStore,
    options: &DiffOptions,
) -> DiffReport {
    let source = Side {
        name: "source",
        store: source,
        uri: source.describe(),
    };
    let target = Side {
        name: "target",
        store: target,
        uri: target.describe(),
    };
    let mut warnings = Vec::new();

    let mut reachable = true;
    for side in [&source, &target] {
        if let Err(e) = side.store.ping().await {
            side.warn(&mut warnings, "connection", e);
            reachable = false;
        }
    }

    let (labels, rel_types) = match options.scope {
        DiffScope::ManagedOnly => (
            MANAGED_NODE_TYPES.iter().map(|n| n.label.to_string()).collect(),
            MANAGED_RELATIONSHIP_TYPES
                .iter()
                .map(|r| r.name.to_string())
                .collect(),
        ),
        DiffScope::Full => {
            let mut labels: BTreeSet<String> = BTreeSet::new();
            let mut rel_types: BTreeSet<String> = BTreeSet::new();
            for side in [&source, &target] {
                labels.extend(side.names(false, &mut warnings).await);
                rel_types.extend(side.names(true, &mut warnings).await);
            }
            (
                labels.into_iter().collect::<Vec<_>>(),
                rel_types.into_iter().collect::<Vec<_>>(),
            )
        }
    };
    debug!(labels = labels.len(), relationship_types = rel_types.len(), "Diff scope resolved");

    let mut node_counts = Vec::with_capacity(labels.len());
    for label in &labels {
        let s = source.count_nodes(label, &mut warnings).await;
        let t = target.count_nodes(label, &mut warnings).await;
        node_counts.push(CountComparison {
            name: label.clone(),
            managed: registry::is_managed_label(label),
            source: s,
            target: t,
            matches: s == t,
        });
    }

    let mut relationship_counts = Vec::with_capacity(rel_types.len());
    for rel_type in &rel_types {
        let s = source.count_relationships(rel_type, &mut warnings).await;
        let t = target.count_relationships(rel_type, &mut warnings).await;
        relationship_counts.push(CountComparison {
            name: rel_type.clone(),
            managed: registry::is_managed_relationship(rel_type),
            source: s,
            target: t,
            matches: s == t,
        });
    }

    let mut samples = Vec::new();
    if options.sample_size > 0 {
        for label in &labels {
            samples.push(
                compare_sample(&source, &target, label, options.sample_size, &mut warnings).await,
            );
        }
    }

    let identical = reachable
        && node_counts.iter().all(|c| c.matches)
        && relationship_counts.iter().all(|c| c.matches)
        && samples.iter().all(SampleComparison::is_clean);

    let report = DiffReport {
        generated_at: Utc::now(),
        source: source.uri,
        target: target.uri,
        scope: options.scope,
        sample_size: options.sample_size,
        node_counts,
        relationship_counts,
        samples,
        warnings,
        identical,
    };
    info!(
        identical = report.identical,
        mismatches = report.mismatch_count(),
        warnings = report.warnings.len(),
        "Diff complete"
    );
    report
}

async fn compare_sample(
    source: &Side<'_>,
    target: &Side<'_>,
    label: &str,
    sample_size: usize,
    warnings: &mut Vec<String>,
) -> SampleComparison {
    let mut comparison = SampleComparison {
        label: label.to_string(),
        key_property: None,
        sampled: 0,
        missing_in_target: Vec::new(),
        missing_in_source: Vec::new(),
        mismatches: Vec::new(),
    };

    let (key, from_source) = match registry::node_type(label) {
        Some(node) => {
            let sample = source.sample(label, node.key, sample_size, warnings).await;
            (node.key, sample)
        }
        None => {
            let mut chosen = None;
            for key in FALLBACK_KEYS {
                let sample = source.sample(label, key, sample_size, warnings).await;
                if !sample.is_empty() {
                    chosen = Some((key, sample));
                    break;
                }
            }
            match chosen {
                Some(found) => found,
                None => return comparison,
            }
        }
    };
    comparison.key_property = Some(key.to_string());
    let from_target = target.sample(label, key, sample_size, warnings).await;

    // Source sample looked up in target, then target-only keys looked up in source.
    let source_keys: Vec<Value> = from_source.iter().filter_map(|n| n.get(key).cloned()).collect();
    let in_target = index_by_key(target.fetch(label, key, &source_keys, warnings).await, key);
    for node in &from_source {
        let Some(k) = node.get(key) else { continue };
        let text = key_text(k);
        match in_target.get(&text) {
            Some(other) => diff_properties(&text, node, other, &mut comparison.mismatches),
            None => comparison.missing_in_target.push(text),
        }
    }

    let target_only: Vec<Value> = from_target
        .iter()
        .filter_map(|n| n.get(key))
        .filter(|k| !source_keys.contains(k))
        .cloned()
        .collect();
    let in_source = index_by_key(source.fetch(label, key, &target_only, warnings).await, key);
    for k in &target_only {
        let text = key_text(k);
        if !in_source.contains_key(&text) {
            comparison.missing_in_source.push(text);
        }
    }

    comparison.sampled = source_keys.len() + target_only.len();
    comparison
}

fn index_by_key(
    nodes: Vec<crate::models::PropertyMap>,
    key: &str,
) -> FxHashMap<String, crate::models::PropertyMap> {
    nodes
        .into_iter()
        .filter_map(|n| Some((key_text(n.get(key)?), n)))
        .collect()
}

fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn diff_properties(
    key: &str,
    source: &crate::models::PropertyMap,
    target: &crate::models::PropertyMap,
    out: &mut Vec<FieldMismatch>,
) {
    let fields: BTreeSet<&String> = source.keys().chain(target.keys()).collect();
    for field in fields {
        if VOLATILE_PROPERTIES.contains(&field.as_str()) {
            continue;
        }
        let s = source.get(field).unwrap_or(&Value::Null);
        let t = target.get(field).unwrap_or(&Value::Null);
        if s != t {
            out.push(FieldMismatch {
                key: key.to_string(),
                field: field.clone(),
                source: s.clone(),
                target: t.clone(),
            });
        }
    }
}
