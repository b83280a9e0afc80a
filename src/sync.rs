//! The graph sync engine: ingestion, selective clear and full drop.
//!
//! Ingestion runs in this order:
//!
//! 1. Managed indexes are created and existing Task ids are read.
//! 2. Datasets, evaluation tables and links stream concurrently. Links are
//!    folded into a paper-key -> repository mapping.
//! 3. Papers, pass one: Paper, Author and Task nodes. Task nodes are only
//!    created for names not already known, so full tasks from evaluation
//!    tables are never overwritten by bare stubs.
//! 4. Papers, pass two over the rewound stream: AUTHORED, ADDRESSES_TASK and
//!    HAS_CODE, then the evaluation-derived ADDRESSES_TASK and USES_DATASET
//!    edges resolved through the paper-url index built in pass one.
//!
//! Clearing and dropping hold the engine's lock exclusively; ingestion holds
//! it shared.

use crate::batch::{BatchWriter, EdgeSink, NodeSink, RetryPolicy};
use crate::config;
use crate::confirm::DropConfirmation;
use crate::error::{StoreError, SyncError};
use crate::models::{
    Author, Dataset, EvaluationRef, GraphEntity, Paper, PropertyMap, RawRecord, Record,
    Repository, SourceKind, Task,
};
use crate::normalize::normalize;
use crate::parser::{ParseSummary, RecordStream};
use crate::registry::{
    self, RelationshipType, MANAGED_INDEXES, MANAGED_NODE_TYPES,
    MANAGED_RELATIONSHIP_TYPES,
};
use crate::stats::{IngestStats, IngestSummary, SourceStats};
use crate::store::{EdgeRow, GraphStore};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// The dump files of one ingestion run. Kinds without a file are skipped.
#[derive(Debug, Clone, Default)]
pub struct SourceFiles {
    paths: BTreeMap<SourceKind, PathBuf>,
}

impl SourceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up every kind's file in `dir` (plain preferred over `.gz`).
    pub fn discover(dir: &Path) -> Self {
        let paths = SourceKind::ALL
            .iter()
            .filter_map(|k| k.locate(dir).map(|p| (*k, p)))
            .collect();
        Self { paths }
    }

    pub fn with(mut self, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(kind, path.into());
        self
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Path> {
        self.paths.get(&kind).map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Caps per entity kind; zero means unlimited. The first entities in file
/// order are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub papers: u64,
    pub repositories: u64,
    pub datasets: u64,
    pub tasks: u64,
}

fn within(limit: u64, taken: usize) -> bool {
    limit == 0 || (taken as u64) < limit
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub limits: Limits,
    pub include_repositories: bool,
    pub batch_size: usize,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub show_progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            include_repositories: true,
            batch_size: config::DEFAULT_BATCH_SIZE,
            workers: config::DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub summary: IngestSummary,
    pub parsed: Vec<ParseSummary>,
    pub counts_before: Vec<(&'static str, u64)>,
    pub counts_after: Vec<(&'static str, u64)>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ClearReport {
    pub relationships: Vec<(&'static str, u64)>,
    pub nodes: Vec<(&'static str, u64)>,
    pub indexes: Vec<String>,
}

/// Repositories a paper can be linked to, keyed by every paper key a link
/// record carried.
type RepositoryIndex = FxHashMap<String, Vec<(String, Option<bool>)>>;

#[derive(Default)]
struct EvaluationIndex {
    tasks: FxHashSet<String>,
    references: Vec<(String, EvaluationRef)>,
}

struct PaperIndex {
    accepted: FxHashSet<String>,
    by_url: FxHashMap<String, String>,
}

/// Normalized records of one source, in file order, a chunk at a time.
struct RecordFeed {
    rx: mpsc::Receiver<Vec<Record>>,
    reader: JoinHandle<RecordStream>,
}

impl RecordFeed {
    /// Stops the reader if it is still running and hands the stream back.
    async fn finish(self) -> Result<RecordStream, SyncError> {
        drop(self.rx);
        self.reader
            .await
            .map_err(|e| SyncError::Worker(e.to_string()))
    }
}

pub struct SyncEngine {
    store: Arc<dyn GraphStore>,
    guard: RwLock<()>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            guard: RwLock::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Node and relationship counts for every managed type.
    pub async fn managed_counts(&self) -> Result<Vec<(&'static str, u64)>, StoreError> {
        let mut counts = Vec::with_capacity(MANAGED_NODE_TYPES.len() + MANAGED_RELATIONSHIP_TYPES.len());
        for node in &MANAGED_NODE_TYPES {
            counts.push((node.label, self.store.count_nodes(node.label).await?));
        }
        for rel in &MANAGED_RELATIONSHIP_TYPES {
            counts.push((rel.name, self.store.count_relationships(rel.name).await?));
        }
        Ok(counts)
    }

    pub async fn ingest(
        &self,
        files: &SourceFiles,
        options: &IngestOptions,
    ) -> Result<IngestReport, SyncError> {
        let _shared = self.guard.read().await;
        let start = Instant::now();
        let target = self.store.describe();

        self.store.ping().await?;
        let counts_before = self.managed_counts().await?;
        for (name, count) in &counts_before {
            info!(store = %target, name, count, "Existing managed data");
        }

        for index in &MANAGED_INDEXES {
            self.store.create_index(index).await?;
        }
        let existing_tasks: FxHashSet<String> = self
            .store
            .existing_keys(&registry::TASK)
            .await?
            .into_iter()
            .collect();
        debug!(existing = existing_tasks.len(), "Loaded existing task ids");

        let stats = IngestStats::new();
        let parsed = Mutex::new(Vec::new());
        let progress = if options.show_progress {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let ctx = RunContext {
            files,
            options,
            stats: &stats,
            parsed: &parsed,
            progress: &progress,
        };

        let ((), evaluations, repositories) = tokio::try_join!(
            self.ingest_datasets(&ctx),
            self.ingest_evaluations(&ctx),
            self.ingest_links(&ctx),
        )?;

        if let Some((stream, papers)) = self.paper_nodes(&ctx, &existing_tasks, &evaluations).await? {
            self.paper_edges(&ctx, stream, &papers, &repositories, &evaluations)
                .await?;
        } else {
            info!("No papers file, skipping paper ingestion");
        }

        let counts_after = self.managed_counts().await?;
        let elapsed = start.elapsed();
        info!(store = %target, elapsed_secs = elapsed.as_secs_f64(), "Ingestion complete");

        let parsed = parsed.into_inner().unwrap_or_default();
        Ok(IngestReport {
            summary: stats.summary(),
            parsed,
            counts_before,
            counts_after,
            elapsed,
        })
    }

    async fn ingest_datasets(&self, ctx: &RunContext<'_>) -> Result<(), SyncError> {
        let kind = SourceKind::Datasets;
        let Some(path) = ctx.files.get(kind) else {
            info!("No datasets file, skipping");
            return Ok(());
        };
        let source = ctx.stats.source(kind);
        let pb = ctx.progress.add(make_spinner(kind));
        let mut feed = spawn_feed(open_stream(path, kind).await?, Arc::clone(&source), pb.clone());
        let mut writer = self.node_writer::<Dataset>(ctx);

        let mut seen = FxHashSet::default();
        'feed: while let Some(chunk) = feed.rx.recv().await {
            for record in chunk {
                let Record::Dataset(dataset) = record else {
                    continue;
                };
                if seen.contains(&dataset.id) {
                    source.inc_duplicates();
                    continue;
                }
                if !within(ctx.options.limits.datasets, seen.len()) {
                    source.inc_beyond_limit();
                    break 'feed;
                }
                seen.insert(dataset.id.clone());
                writer.push(node_row(&dataset)).await?;
            }
        }

        ctx.record_parse(feed.finish().await?.summary());
        writer.finish().await?;
        pb.finish_with_message(format!("{kind}: {} ingested", seen.len()));
        Ok(())
    }

    async fn ingest_evaluations(&self, ctx: &RunContext<'_>) -> Result<EvaluationIndex, SyncError> {
        let kind = SourceKind::Evaluations;
        let mut index = EvaluationIndex::default();
        let Some(path) = ctx.files.get(kind) else {
            info!("No evaluation tables file, skipping");
            return Ok(index);
        };
        let source = ctx.stats.source(kind);
        let pb = ctx.progress.add(make_spinner(kind));
        let mut feed = spawn_feed(open_stream(path, kind).await?, Arc::clone(&source), pb.clone());
        let mut writer = self.node_writer::<Task>(ctx);

        'feed: while let Some(chunk) = feed.rx.recv().await {
            for record in chunk {
                let Record::Evaluation(evaluation) = record else {
                    continue;
                };
                if index.tasks.contains(&evaluation.task.id) {
                    source.inc_duplicates();
                    continue;
                }
                if !within(ctx.options.limits.tasks, index.tasks.len()) {
                    source.inc_beyond_limit();
                    break 'feed;
                }
                index.tasks.insert(evaluation.task.id.clone());
                writer.push(node_row(&evaluation.task)).await?;
                let task_id = evaluation.task.id;
                index.references.extend(
                    evaluation
                        .references
                        .into_iter()
                        .map(|r| (task_id.clone(), r)),
                );
            }
        }

        ctx.record_parse(feed.finish().await?.summary());
        writer.finish().await?;
        pb.finish_with_message(format!(
            "{kind}: {} tasks, {} results",
            index.tasks.len(),
            index.references.len()
        ));
        Ok(index)
    }

    async fn ingest_links(&self, ctx: &RunContext<'_>) -> Result<RepositoryIndex, SyncError> {
        let kind = SourceKind::Links;
        let mut mapping = RepositoryIndex::default();
        if !ctx.options.include_repositories {
            info!("Repositories excluded, skipping links");
            return Ok(mapping);
        }
        let Some(path) = ctx.files.get(kind) else {
            info!("No links file, skipping");
            return Ok(mapping);
        };
        let source = ctx.stats.source(kind);
        let pb = ctx.progress.add(make_spinner(kind));
        let mut feed = spawn_feed(open_stream(path, kind).await?, Arc::clone(&source), pb.clone());
        let mut writer = self.node_writer::<Repository>(ctx);

        // one repository is usually linked from several papers
        let mut repositories: FxHashSet<String> = FxHashSet::default();
        while let Some(chunk) = feed.rx.recv().await {
            for record in chunk {
                let Record::Link(link) = record else {
                    continue;
                };
                let url = link.repository.url.clone();
                if repositories.contains(&url) {
                    source.inc_duplicates();
                } else if within(ctx.options.limits.repositories, repositories.len()) {
                    repositories.insert(url.clone());
                    writer.push(node_row(&link.repository)).await?;
                } else {
                    source.inc_beyond_limit();
                    continue;
                }
                for key in link.paper_keys {
                    let linked = mapping.entry(key).or_default();
                    if !linked.iter().any(|(u, _)| *u == url) {
                        linked.push((url.clone(), link.official));
                    }
                }
            }
        }

        ctx.record_parse(feed.finish().await?.summary());
        writer.finish().await?;
        pb.finish_with_message(format!(
            "{kind}: {} repositories for {} paper keys",
            repositories.len(),
            mapping.len()
        ));
        Ok(mapping)
    }

    /// First pass over the papers file: every node a paper contributes.
    async fn paper_nodes(
        &self,
        ctx: &RunContext<'_>,
        existing_tasks: &FxHashSet<String>,
        evaluations: &EvaluationIndex,
    ) -> Result<Option<(RecordStream, PaperIndex)>, SyncError> {
        let kind = SourceKind::Papers;
        let Some(path) = ctx.files.get(kind) else {
            return Ok(None);
        };
        let source = ctx.stats.source(kind);
        let pb = ctx.progress.add(make_spinner(kind));
        let mut feed = spawn_feed(open_stream(path, kind).await?, Arc::clone(&source), pb.clone());

        let mut papers = self.node_writer::<Paper>(ctx);
        let mut authors = self.node_writer::<Author>(ctx);
        let mut tasks = self.node_writer::<Task>(ctx);

        let mut index = PaperIndex {
            accepted: FxHashSet::default(),
            by_url: FxHashMap::default(),
        };
        let mut seen_authors: FxHashSet<String> = FxHashSet::default();
        let mut known_tasks: FxHashSet<String> = existing_tasks
            .iter()
            .chain(evaluations.tasks.iter())
            .cloned()
            .collect();
        let mut stubs = 0u64;

        'feed: while let Some(chunk) = feed.rx.recv().await {
            for record in chunk {
                let Record::Paper(record) = record else {
                    continue;
                };
                let id = record.paper.id.clone();
                if index.accepted.contains(&id) {
                    source.inc_duplicates();
                    continue;
                }
                if !within(ctx.options.limits.papers, index.accepted.len()) {
                    source.inc_beyond_limit();
                    break 'feed;
                }
                index.accepted.insert(id.clone());
                if let Some(url) = &record.paper.paper_url {
                    index.by_url.entry(url.clone()).or_insert_with(|| id.clone());
                }

                papers.push(node_row(&record.paper)).await?;
                for author in &record.authors {
                    if seen_authors.insert(author.name.clone()) {
                        authors.push(node_row(author)).await?;
                    }
                }
                for name in &record.tasks {
                    if known_tasks.insert(name.clone()) {
                        stubs += 1;
                        tasks.push(node_row(&Task::stub(name))).await?;
                    }
                }
            }
        }

        let stream = feed.finish().await?;
        ctx.record_parse(stream.summary());
        papers.finish().await?;
        authors.finish().await?;
        tasks.finish().await?;
        pb.finish_with_message(format!(
            "{kind}: {} papers, {} authors, {stubs} new tasks",
            index.accepted.len(),
            seen_authors.len()
        ));
        Ok(Some((stream, index)))
    }

    /// Second pass over the rewound papers file: every relationship.
    async fn paper_edges(
        &self,
        ctx: &RunContext<'_>,
        stream: RecordStream,
        papers: &PaperIndex,
        repositories: &RepositoryIndex,
        evaluations: &EvaluationIndex,
    ) -> Result<(), SyncError> {
        let stream = rewind_stream(stream).await?;
        let pb = ctx.progress.add(make_spinner(SourceKind::Papers));
        pb.set_message("papers (relationships)");
        // the first pass already counted this file
        let mut feed = spawn_feed(stream, Arc::new(SourceStats::new()), pb.clone());

        let mut authored = self.edge_writer(registry::AUTHORED, ctx);
        let mut addresses = self.edge_writer(registry::ADDRESSES_TASK, ctx);
        let mut has_code = self.edge_writer(registry::HAS_CODE, ctx);
        let mut uses_dataset = self.edge_writer(registry::USES_DATASET, ctx);

        let mut done: FxHashSet<String> = FxHashSet::default();
        'feed: while let Some(chunk) = feed.rx.recv().await {
            for record in chunk {
                if done.len() == papers.accepted.len() {
                    break 'feed;
                }
                let Record::Paper(record) = record else {
                    continue;
                };
                let id = &record.paper.id;
                if !papers.accepted.contains(id) || !done.insert(id.clone()) {
                    continue;
                }

                for author in &record.authors {
                    authored.push(EdgeRow::new(&author.name, id)).await?;
                }
                for task in &record.tasks {
                    addresses.push(EdgeRow::new(id, task)).await?;
                }

                let keys = [
                    Some(id.as_str()),
                    record.paper.arxiv_id.as_deref(),
                    record.paper.paper_url.as_deref(),
                ];
                let mut linked: Vec<&(String, Option<bool>)> = Vec::new();
                for key in keys.into_iter().flatten() {
                    for link in repositories.get(key).into_iter().flatten() {
                        if !linked.iter().any(|l| l.0 == link.0) {
                            linked.push(link);
                        }
                    }
                }
                for (url, official) in linked {
                    let mut row = EdgeRow::new(id, url);
                    if let Some(official) = official {
                        row = row.with_property("official", *official);
                    }
                    has_code.push(row).await?;
                }
            }
        }
        feed.finish().await?;

        let mut pairs: FxHashSet<(&str, &str, &str)> = FxHashSet::default();
        let mut unresolved = 0u64;
        for (task_id, reference) in &evaluations.references {
            let Some(paper_id) = papers.by_url.get(&reference.paper_url) else {
                unresolved += 1;
                continue;
            };
            if pairs.insert((paper_id.as_str(), task_id.as_str(), reference.dataset.as_str())) {
                addresses.push(EdgeRow::new(paper_id, task_id)).await?;
                uses_dataset
                    .push(EdgeRow::new(paper_id, &reference.dataset))
                    .await?;
            }
        }
        if unresolved > 0 {
            debug!(unresolved, "Evaluation results for papers not ingested in this run");
        }

        authored.finish().await?;
        addresses.finish().await?;
        has_code.finish().await?;
        uses_dataset.finish().await?;
        pb.finish_with_message(format!("papers: relationships for {} papers", done.len()));
        Ok(())
    }

    /// Spawns a writer for the label the entity type maps onto.
    fn node_writer<E: GraphEntity>(&self, ctx: &RunContext<'_>) -> BatchWriter<NodeSink> {
        let node = E::NODE;
        BatchWriter::spawn(
            Arc::new(NodeSink::new(Arc::clone(&self.store), node)),
            ctx.options.workers,
            ctx.options.batch_size,
            ctx.options.retry,
            ctx.stats.target(node.label),
        )
    }

    fn edge_writer(&self, rel: RelationshipType, ctx: &RunContext<'_>) -> BatchWriter<EdgeSink> {
        BatchWriter::spawn(
            Arc::new(EdgeSink::new(Arc::clone(&self.store), rel)),
            ctx.options.workers,
            ctx.options.batch_size,
            ctx.options.retry,
            ctx.stats.target(rel.name),
        )
    }

    /// Deletes managed relationships, then managed nodes, then managed
    /// indexes. Nothing outside the registry is touched, except foreign
    /// relationships attached to a managed node, which go with that node.
    pub async fn clear_managed(&self) -> Result<ClearReport, SyncError> {
        let _exclusive = self.guard.write().await;
        let target = self.store.describe();
        info!(store = %target, "Clearing managed data");

        let mut report = ClearReport::default();
        for rel in &MANAGED_RELATIONSHIP_TYPES {
            let deleted = self.store.delete_relationship_type(rel.name).await?;
            info!(store = %target, relationship = rel.name, deleted, "Cleared relationships");
            report.relationships.push((rel.name, deleted));
        }
        for node in &MANAGED_NODE_TYPES {
            let deleted = self.store.delete_label(node.label).await?;
            info!(store = %target, label = node.label, deleted, "Cleared nodes");
            report.nodes.push((node.label, deleted));
        }

        let managed = registry::managed_index_names();
        for name in self.store.index_names().await? {
            if managed.contains(name.as_str()) {
                self.store.drop_index(&name).await?;
                report.indexes.push(name);
            } else {
                trace!(store = %target, index = %name, "Keeping foreign index");
            }
        }
        Ok(report)
    }

    /// Deletes everything in the store. Needs a confirmation that was given
    /// for this very store.
    pub async fn drop_all(&self, confirmation: DropConfirmation) -> Result<(), SyncError> {
        let target = self.store.describe();
        if confirmation.target() != target {
            return Err(SyncError::ConfirmationMismatch {
                confirmed: confirmation.target().to_string(),
                target,
            });
        }
        let _exclusive = self.guard.write().await;
        warn!(store = %target, "Dropping all data");
        self.store.drop_everything().await?;
        Ok(())
    }
}

struct RunContext<'a> {
    files: &'a SourceFiles,
    options: &'a IngestOptions,
    stats: &'a IngestStats,
    parsed: &'a Mutex<Vec<ParseSummary>>,
    progress: &'a MultiProgress,
}

impl RunContext<'_> {
    fn record_parse(&self, summary: ParseSummary) {
        info!(
            source = %summary.kind,
            layout = ?summary.layout,
            records = summary.records,
            malformed = summary.malformed,
            "Source parsed"
        );
        if let Ok(mut parsed) = self.parsed.lock() {
            parsed.push(summary);
        }
    }
}

fn node_row<E: GraphEntity>(entity: &E) -> (String, PropertyMap) {
    (entity.key().to_string(), entity.properties())
}

async fn open_stream(path: &Path, kind: SourceKind) -> Result<RecordStream, SyncError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || RecordStream::open(&path, kind))
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))?
        .map_err(SyncError::from)
}

async fn rewind_stream(mut stream: RecordStream) -> Result<RecordStream, SyncError> {
    tokio::task::spawn_blocking(move || {
        let rewound = stream.rewind();
        rewound.map(|()| stream)
    })
    .await
    .map_err(|e| SyncError::Worker(e.to_string()))?
    .map_err(SyncError::from)
}

/// Reads and normalizes on the blocking pool; each chunk of raw records is
/// normalized in parallel with its order preserved. Stops early once the
/// consumer drops its receiver.
fn spawn_feed(mut stream: RecordStream, stats: Arc<SourceStats>, pb: ProgressBar) -> RecordFeed {
    let (tx, rx) = mpsc::channel(config::CHANNEL_BATCHES);
    let reader = tokio::task::spawn_blocking(move || {
        let kind = stream.kind();
        loop {
            let chunk: Vec<RawRecord> = stream.by_ref().take(config::NORMALIZE_CHUNK).collect();
            if chunk.is_empty() {
                break;
            }
            stats.add_read(chunk.len() as u64);
            pb.inc(chunk.len() as u64);

            let normalized: Vec<_> = chunk.par_iter().map(|raw| normalize(kind, raw)).collect();
            let mut records = Vec::with_capacity(normalized.len());
            for result in normalized {
                match result {
                    Ok(record) => records.push(record),
                    Err(rejection) => {
                        stats.inc_rejected();
                        trace!(source = %kind, %rejection, "Record rejected");
                    }
                }
            }
            if tx.blocking_send(records).is_err() {
                debug!(source = %kind, "Consumer stopped reading");
                break;
            }
        }
        stats.add_malformed(stream.summary().malformed);
        stream
    });
    RecordFeed { rx, reader }
}

fn make_spinner(kind: SourceKind) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg:<24} {pos:>10} records [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(kind.name().to_string());
    pb
}
