//! Chunked ingestion: fetch, parse and merge K snapshots, flush once, commit.

use crate::analyzer::AnalyzeError;
use crate::backoff::RetryPolicy;
use crate::checkpoint::{CheckpointError, CheckpointManager, SnapshotState, StagedResult, StagedSnapshot};
use crate::config::PipelineConfig;
use crate::enrich::EnrichError;
use crate::export::ExportError;
use crate::feed::NewDomainFeed;
use crate::merge::merge;
use crate::metrics::SharedMetrics;
use crate::models::SnapshotRef;
use crate::network::FetchError;
use crate::parser::parse_snapshot;
use crate::rank_store::RankStore;
use crate::source::SnapshotSource;
use crate::state::{RankBackend, StoreError};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Snapshot source error: {0}")]
    Source(#[from] FetchError),

    #[error("Analysis error: {0}")]
    Analyze(#[from] AnalyzeError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Enrichment error: {0}")]
    Enrich(#[from] EnrichError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Flushing chunk {chunk} failed, its snapshots stay pending: {source}")]
    Persistence {
        chunk: usize,
        #[source]
        source: StoreError,
    },

    #[error("Chunk {chunk} does not exist ({chunks} chunks queued)")]
    ChunkOutOfRange { chunk: usize, chunks: usize },

    #[error("Store has no snapshot dates")]
    EmptyStore,
}

/// Outcome of an ingestion run over the selected chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub queued: usize,
    pub committed: usize,
    pub committed_with_failure: usize,
    pub still_pending: usize,
    /// Already settled before this run started.
    pub skipped: usize,
    pub chunks_committed: usize,
    pub domains_updated: u64,
    pub new_domains: u64,
    pub interrupted: bool,
}

impl RunSummary {
    /// Snapshots that did not make it into the store.
    pub fn unresolved(&self) -> usize {
        self.still_pending + self.committed_with_failure
    }
}

/// Per-chunk result before the checkpoint is touched.
#[derive(Default)]
struct ChunkWork {
    staged: Vec<StagedSnapshot>,
    feed_dates: BTreeSet<NaiveDate>,
    domains_updated: u64,
    new_domains: u64,
}

pub struct ChunkProcessor {
    backend: Arc<dyn RankBackend>,
    source: Arc<dyn SnapshotSource>,
    checkpoint: CheckpointManager,
    config: PipelineConfig,
    retry: RetryPolicy,
    metrics: SharedMetrics,
    feed: Option<NewDomainFeed>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ChunkProcessor {
    pub fn new(
        backend: Arc<dyn RankBackend>,
        source: Arc<dyn SnapshotSource>,
        checkpoint: CheckpointManager,
        config: PipelineConfig,
        metrics: SharedMetrics,
    ) -> Self {
        let retry = RetryPolicy::exponential(
            config.max_attempts,
            config.retry_backoff_ms,
            crate::config::Config::RETRY_BACKOFF_MAX_MS,
        );
        let feed = config.feed_dir().map(NewDomainFeed::new);
        Self {
            backend,
            source,
            checkpoint,
            config,
            retry,
            metrics,
            feed,
            shutdown: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stop after the current chunk once `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// The date-filtered queue, in processing order.
    pub async fn queue(&self) -> Result<Vec<SnapshotRef>, PipelineError> {
        let queue: Vec<SnapshotRef> = self
            .source
            .list()
            .await?
            .into_iter()
            .filter(|snapshot| self.config.includes(snapshot.date))
            .collect();
        Ok(queue)
    }

    #[tracing::instrument(skip(self), fields(chunk_size = self.config.chunk_size))]
    pub async fn run(&mut self) -> Result<RunSummary, PipelineError> {
        let queue = self.queue().await?;
        self.checkpoint.register(&queue);

        let chunk_size = self.config.chunk_size.max(1);
        let chunks: Vec<(usize, &[SnapshotRef])> = queue.chunks(chunk_size).enumerate().collect();
        let selected: Vec<(usize, &[SnapshotRef])> = match self.config.chunk_id {
            Some(chunk) => {
                let found = chunks.iter().find(|(index, _)| *index == chunk).copied();
                match found {
                    Some(entry) => vec![entry],
                    None => {
                        return Err(PipelineError::ChunkOutOfRange {
                            chunk,
                            chunks: chunks.len(),
                        })
                    }
                }
            }
            None => chunks,
        };

        let mut summary = RunSummary {
            queued: selected.iter().map(|(_, members)| members.len()).sum(),
            ..RunSummary::default()
        };
        tracing::info!(
            "{} snapshots selected in {} chunks",
            summary.queued,
            selected.len()
        );

        for (index, members) in &selected {
            let work: Vec<&SnapshotRef> = members
                .iter()
                .filter(|snapshot| self.checkpoint.needs_work(&snapshot.id, self.config.retry_failed))
                .collect();
            summary.skipped += members.len() - work.len();
            if work.is_empty() {
                tracing::debug!("chunk {} already committed, skipping", index);
                continue;
            }

            let result = self.process_chunk(*index, members, &work).await?;
            summary.domains_updated += result.domains_updated;
            summary.new_domains += result.new_domains;
            if result.committed {
                summary.chunks_committed += 1;
            }

            if self.stop_requested() {
                tracing::warn!("shutdown requested, stopping after chunk {}", index);
                summary.interrupted = true;
                break;
            }
        }

        for (_, members) in &selected {
            for snapshot in members.iter() {
                match self.checkpoint.state(&snapshot.id) {
                    SnapshotState::Committed => summary.committed += 1,
                    SnapshotState::CommittedWithFailure => summary.committed_with_failure += 1,
                    SnapshotState::Pending | SnapshotState::InProgress => summary.still_pending += 1,
                }
            }
        }

        self.metrics.log_summary();
        tracing::info!(
            committed = summary.committed,
            failed = summary.committed_with_failure,
            pending = summary.still_pending,
            skipped = summary.skipped,
            "ingestion finished"
        );
        Ok(summary)
    }

    async fn process_chunk(
        &mut self,
        index: usize,
        members: &[SnapshotRef],
        work: &[&SnapshotRef],
    ) -> Result<ChunkResult, PipelineError> {
        let dates: Vec<NaiveDate> = work
            .iter()
            .map(|snapshot| snapshot.date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        tracing::info!(
            chunk = index,
            snapshots = work.len(),
            "processing {} .. {}",
            dates.first().map(|d| d.to_string()).unwrap_or_default(),
            dates.last().map(|d| d.to_string()).unwrap_or_default()
        );

        for snapshot in work {
            self.checkpoint.mark_in_progress(snapshot);
        }

        let mut store = match self.backend.load_columns(&dates) {
            Ok(store) => store,
            Err(e) => {
                for snapshot in work {
                    self.checkpoint.record_transient_failure(snapshot, &e.to_string());
                }
                self.checkpoint.save()?;
                return Err(PipelineError::Persistence { chunk: index, source: e });
            }
        };

        let chunk = self.ingest(&mut store, work).await;
        if chunk.staged.is_empty() {
            self.checkpoint.save()?;
            return Ok(ChunkResult::default());
        }

        if chunk
            .staged
            .iter()
            .any(|staged| staged.result == StagedResult::Merged)
        {
            let started = Instant::now();
            match self.backend.save(&store, None) {
                Ok(stats) => {
                    self.metrics.cells_written.add(stats.cells_written as u64);
                    self.metrics.flush_latency.lock().observe(started.elapsed());
                }
                Err(e) => {
                    tracing::error!("flush of chunk {} failed: {}", index, e);
                    self.checkpoint.revert(&chunk.staged, &e.to_string());
                    self.checkpoint.save()?;
                    return Err(PipelineError::Persistence { chunk: index, source: e });
                }
            }

            if let Some(feed) = &self.feed {
                if let Err(e) = feed.write_dates(&store, &chunk.feed_dates) {
                    self.checkpoint.revert(&chunk.staged, &e.to_string());
                    self.checkpoint.save()?;
                    return Err(e.into());
                }
            }
        }

        self.checkpoint
            .commit_chunk(index, members, &chunk.staged, chunk.domains_updated)?;
        self.metrics.chunks_flushed.inc();

        let committed = members
            .iter()
            .all(|snapshot| self.checkpoint.state(&snapshot.id).is_settled());
        Ok(ChunkResult {
            committed,
            domains_updated: chunk.domains_updated,
            new_domains: chunk.new_domains,
        })
    }

    /// Fetch, parse and merge each snapshot into `store`.
    async fn ingest(&mut self, store: &mut RankStore, work: &[&SnapshotRef]) -> ChunkWork {
        let mut chunk = ChunkWork::default();

        for snapshot in work {
            let started = Instant::now();
            let source = &self.source;
            let fetched = self
                .retry
                .run(&snapshot.id, || source.fetch(snapshot))
                .await;
            self.metrics.fetch_latency.lock().observe(started.elapsed());

            let bytes = match fetched {
                Ok(bytes) => bytes,
                Err(e) if e.is_permanent() => {
                    tracing::warn!("{} is unavailable: {}", snapshot.id, e);
                    self.metrics.fetch_failures.inc();
                    chunk.staged.push(StagedSnapshot {
                        id: snapshot.id.clone(),
                        date: snapshot.date,
                        result: StagedResult::PermanentFailure(e.to_string()),
                    });
                    continue;
                }
                Err(e) => {
                    tracing::warn!("{} failed, leaving it pending: {}", snapshot.id, e);
                    self.metrics.fetch_failures.inc();
                    self.checkpoint.record_transient_failure(snapshot, &e.to_string());
                    continue;
                }
            };
            self.metrics.snapshots_fetched.inc();

            let parsed = parse_snapshot(&bytes);
            self.metrics.rows_parsed.add(parsed.entries.len() as u64);
            self.metrics.rows_skipped.add(parsed.issues.len() as u64);
            if parsed.is_empty() {
                tracing::warn!("{} has no valid rows", snapshot.id);
                chunk.staged.push(StagedSnapshot {
                    id: snapshot.id.clone(),
                    date: snapshot.date,
                    result: StagedResult::PermanentFailure("snapshot has no valid rows".to_string()),
                });
                continue;
            }

            let outcome = merge(store, snapshot.date, &parsed.entries);
            tracing::info!(
                snapshot = %snapshot.id,
                rows = parsed.entries.len(),
                new_domains = outcome.new_domains.len(),
                "merged"
            );
            chunk.domains_updated += outcome.domains_updated as u64;
            chunk.new_domains += outcome.new_domains.len() as u64;
            chunk.feed_dates.insert(snapshot.date);
            chunk
                .feed_dates
                .extend(outcome.lowered.iter().map(|(_, previous)| *previous));
            chunk.staged.push(StagedSnapshot {
                id: snapshot.id.clone(),
                date: snapshot.date,
                result: StagedResult::Merged,
            });
        }

        chunk
    }
}

#[derive(Debug, Default)]
struct ChunkResult {
    committed: bool,
    domains_updated: u64,
    new_domains: u64,
}
