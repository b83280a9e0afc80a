//! Partitioned, bounded batch writers.
//!
//! Rows for one target are routed by a hash of their identifier to one of N
//! partitions. Each partition owns a bounded channel and a single writer task,
//! so two batches never upsert the same identifier concurrently while
//! different partitions still write in parallel.

use crate::config;
use crate::error::{StoreError, SyncError};
use crate::models::PropertyMap;
use crate::registry::{NodeType, RelationshipType};
use crate::stats::WriteStats;
use crate::store::{EdgeRow, GraphStore};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: config::STORE_MAX_RETRIES,
            base_delay: Duration::from_millis(config::RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Where a partition writer sends its batches.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    type Row: Send + Sync + 'static;

    /// Label or relationship type, for logs and stats.
    fn target(&self) -> &'static str;

    /// The identifier a row is partitioned on.
    fn partition_key<'a>(&self, row: &'a Self::Row) -> &'a str;

    /// Writes a batch; returns how many rows the store actually merged.
    async fn write(&self, rows: &[Self::Row]) -> Result<u64, StoreError>;
}

pub struct NodeSink {
    store: Arc<dyn GraphStore>,
    node: NodeType,
}

impl NodeSink {
    pub fn new(store: Arc<dyn GraphStore>, node: NodeType) -> Self {
        Self { store, node }
    }
}

#[async_trait]
impl BatchSink for NodeSink {
    type Row = (String, PropertyMap);

    fn target(&self) -> &'static str {
        self.node.label
    }

    fn partition_key<'a>(&self, row: &'a Self::Row) -> &'a str {
        &row.0
    }

    async fn write(&self, rows: &[Self::Row]) -> Result<u64, StoreError> {
        let props: Vec<PropertyMap> = rows.iter().map(|(_, p)| p.clone()).collect();
        self.store.upsert_nodes(&self.node, &props).await
    }
}

pub struct EdgeSink {
    store: Arc<dyn GraphStore>,
    rel: RelationshipType,
}

impl EdgeSink {
    pub fn new(store: Arc<dyn GraphStore>, rel: RelationshipType) -> Self {
        Self { store, rel }
    }
}

#[async_trait]
impl BatchSink for EdgeSink {
    type Row = EdgeRow;

    fn target(&self) -> &'static str {
        self.rel.name
    }

    /// Partitioned on the source node so merges on one node never race.
    fn partition_key<'a>(&self, row: &'a Self::Row) -> &'a str {
        &row.from
    }

    async fn write(&self, rows: &[Self::Row]) -> Result<u64, StoreError> {
        self.store.upsert_edges(&self.rel, rows).await
    }
}

pub struct BatchWriter<S: BatchSink> {
    sink: Arc<S>,
    senders: Vec<mpsc::Sender<Vec<S::Row>>>,
    buffers: Vec<Vec<S::Row>>,
    batch_size: usize,
    workers: FuturesUnordered<JoinHandle<Result<(), StoreError>>>,
}

impl<S: BatchSink> BatchWriter<S> {
    pub fn spawn(
        sink: Arc<S>,
        partitions: usize,
        batch_size: usize,
        retry: RetryPolicy,
        stats: Arc<WriteStats>,
    ) -> Self {
        let partitions = partitions.max(1);
        let batch_size = batch_size.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let workers = FuturesUnordered::new();

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(config::CHANNEL_BATCHES);
            senders.push(tx);
            workers.push(tokio::spawn(run_partition(
                Arc::clone(&sink),
                partition,
                rx,
                retry,
                Arc::clone(&stats),
            )));
        }

        Self {
            sink,
            senders,
            buffers: (0..partitions).map(|_| Vec::with_capacity(batch_size)).collect(),
            batch_size,
            workers,
        }
    }

    fn partition_of(&self, row: &S::Row) -> usize {
        let mut hasher = FxHasher::default();
        self.sink.partition_key(row).hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    pub async fn push(&mut self, row: S::Row) -> Result<(), SyncError> {
        if self.senders.is_empty() {
            return Err(SyncError::Worker(format!(
                "{} writer already stopped",
                self.sink.target()
            )));
        }
        let partition = self.partition_of(&row);
        self.buffers[partition].push(row);
        if self.buffers[partition].len() >= self.batch_size {
            self.flush(partition).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, partition: usize) -> Result<(), SyncError> {
        if self.buffers[partition].is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(
            &mut self.buffers[partition],
            Vec::with_capacity(self.batch_size),
        );
        let Some(sender) = self.senders.get(partition) else {
            return Err(SyncError::Worker(format!(
                "{} writer already stopped",
                self.sink.target()
            )));
        };
        if sender.send(batch).await.is_err() {
            // the writer stopped early; its result explains why
            return Err(self.shutdown().await.err().unwrap_or_else(|| {
                SyncError::Worker(format!("{} writer stopped", self.sink.target()))
            }));
        }
        Ok(())
    }

    /// Flushes partial batches and waits for every partition writer.
    pub async fn finish(mut self) -> Result<(), SyncError> {
        for partition in 0..self.buffers.len() {
            self.flush(partition).await?;
        }
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<(), SyncError> {
        self.senders.clear();
        let mut first_error = None;
        while let Some(joined) = self.workers.next().await {
            let outcome = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => SyncError::Store(e),
                Err(e) => SyncError::Worker(e.to_string()),
            };
            if first_error.is_none() {
                first_error = Some(outcome);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_partition<S: BatchSink>(
    sink: Arc<S>,
    partition: usize,
    mut rx: mpsc::Receiver<Vec<S::Row>>,
    retry: RetryPolicy,
    stats: Arc<WriteStats>,
) -> Result<(), StoreError> {
    while let Some(batch) = rx.recv().await {
        write_batch(&*sink, partition, &batch, retry, &stats).await?;
    }
    Ok(())
}

/// Writes one batch. A data error splits the batch into single-row writes so
/// one bad row costs only itself; anything else that survives the retries
/// stops this writer.
async fn write_batch<S: BatchSink>(
    sink: &S,
    partition: usize,
    batch: &[S::Row],
    retry: RetryPolicy,
    stats: &WriteStats,
) -> Result<(), StoreError> {
    match write_with_retry(sink, batch, retry, stats).await {
        Ok(merged) => {
            record_merged(stats, batch.len(), merged);
            debug!(sink = sink.target(), partition, rows = batch.len(), merged, "Batch written");
            Ok(())
        }
        Err(StoreError::Query(reason)) => {
            warn!(
                sink = sink.target(),
                partition,
                rows = batch.len(),
                %reason,
                "Batch rejected, retrying row by row"
            );
            for row in batch {
                match write_with_retry(sink, std::slice::from_ref(row), retry, stats).await {
                    Ok(merged) => record_merged(stats, 1, merged),
                    Err(StoreError::Query(reason)) => {
                        let key = sink.partition_key(row);
                        warn!(sink = sink.target(), key, %reason, "Row rejected");
                        stats.record_failure(format!("{key}: {reason}"));
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn record_merged(stats: &WriteStats, rows: usize, merged: u64) {
    stats.add_written(merged);
    stats.add_unmatched((rows as u64).saturating_sub(merged));
}

async fn write_with_retry<S: BatchSink>(
    sink: &S,
    rows: &[S::Row],
    retry: RetryPolicy,
    stats: &WriteStats,
) -> Result<u64, StoreError> {
    let mut attempt = 0;
    loop {
        match sink.write(rows).await {
            Ok(merged) => return Ok(merged),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                stats.inc_retries();
                let delay = retry.delay(attempt);
                warn!(sink = sink.target(), attempt, ?delay, error = %e, "Retrying write");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PAPER;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn paper_row(id: &str) -> (String, PropertyMap) {
        let props: PropertyMap = serde_json::from_value(json!({"id": id})).unwrap();
        (id.to_string(), props)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn writes_all_rows_across_partitions() {
        let store = Arc::new(MemoryStore::new("batch"));
        let stats = Arc::new(WriteStats::new());
        let sink = Arc::new(NodeSink::new(store.clone(), PAPER));
        let mut writer = BatchWriter::spawn(sink, 4, 7, fast_retry(), stats.clone());
        for i in 0..100 {
            writer.push(paper_row(&format!("p{i}"))).await.unwrap();
        }
        writer.finish().await.unwrap();

        assert_eq!(store.count_nodes("Paper").await.unwrap(), 100);
        assert_eq!(stats.written(), 100);
        assert_eq!(stats.failed(), 0);
    }

    #[tokio::test]
    async fn same_key_always_lands_in_same_partition() {
        let store = Arc::new(MemoryStore::new("batch"));
        let sink = Arc::new(NodeSink::new(store, PAPER));
        let writer = BatchWriter::spawn(sink, 8, 10, fast_retry(), Arc::new(WriteStats::new()));
        let a = writer.partition_of(&paper_row("same"));
        let b = writer.partition_of(&paper_row("same"));
        assert_eq!(a, b);
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn bad_row_does_not_sink_its_batch() {
        let store = Arc::new(MemoryStore::new("batch"));
        store.reject_key("p3");
        let stats = Arc::new(WriteStats::new());
        let sink = Arc::new(NodeSink::new(store.clone(), PAPER));
        let mut writer = BatchWriter::spawn(sink, 1, 10, fast_retry(), stats.clone());
        for i in 0..6 {
            writer.push(paper_row(&format!("p{i}"))).await.unwrap();
        }
        writer.finish().await.unwrap();

        assert_eq!(store.count_nodes("Paper").await.unwrap(), 5);
        assert_eq!(stats.written(), 5);
        assert_eq!(stats.failed(), 1);
        assert!(stats.failures()[0].starts_with("p3:"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let store = Arc::new(MemoryStore::new("batch"));
        store.fail_next_writes(2);
        let stats = Arc::new(WriteStats::new());
        let sink = Arc::new(NodeSink::new(store.clone(), PAPER));
        let mut writer = BatchWriter::spawn(sink, 1, 10, fast_retry(), stats.clone());
        writer.push(paper_row("p1")).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(stats.retried(), 2);
        assert_eq!(store.count_nodes("Paper").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_aborts() {
        let store = Arc::new(MemoryStore::new("batch"));
        store.set_offline(true);
        let sink = Arc::new(NodeSink::new(store.clone(), PAPER));
        let mut writer = BatchWriter::spawn(
            sink,
            2,
            1,
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
            },
            Arc::new(WriteStats::new()),
        );

        let mut outcome = Ok(());
        for i in 0..50 {
            outcome = writer.push(paper_row(&format!("p{i}"))).await;
            if outcome.is_err() {
                break;
            }
        }
        let outcome = match outcome {
            Ok(()) => writer.finish().await,
            Err(e) => Err(e),
        };
        match outcome {
            Err(SyncError::Store(e)) => assert!(e.is_connectivity()),
            other => panic!("expected connectivity failure, got {other:?}"),
        }
    }
}
