//! Checkpointed batch transfer of one collection.
//!
//! Each collection is driven through an explicit state machine:
//!
//! ```text
//! Init -> FetchPage -> WriteBatch -> AdvanceCheckpoint -> FetchPage -> ... -> Done
//!   \________________________\_______________________\
//!                                                     -> Failed
//! ```
//!
//! A page is written before its checkpoint is advanced. A crash or
//! cancellation between the two re-transfers that batch on the next run
//! (at-least-once delivery); a batch is never skipped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectionSpec;
use crate::core::{Boundary, Document, RecordSink, RecordSource, SortSpec};
use crate::error::{ErrorKind, MigrateError, Result};
use crate::state::{Checkpoint, CheckpointStore};

/// Default number of documents per page.
pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Transfer engine configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Documents per page, unless the collection overrides it.
    pub batch_size: usize,
    /// Fetch pages without writing documents or checkpoints.
    pub dry_run: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

/// Per-collection state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    FetchPage,
    WriteBatch,
    AdvanceCheckpoint,
    Done,
    Failed,
}

/// Statistics for one collection in one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    /// Documents written in this run.
    pub documents: u64,
    /// Batches written in this run.
    pub batches: u64,
    /// Pages requested from the source, including the final empty one.
    pub pages_fetched: u64,
    /// Checkpoints persisted in this run.
    pub checkpoint_writes: u64,
    /// Documents transferred across all runs, per the checkpoint.
    pub total_documents: u64,
    /// Wall-clock time spent on the collection.
    pub duration_seconds: f64,
}

/// Terminal status of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Done,
    Failed,
}

/// Why a collection failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionFailure {
    /// Phase the failure happened in.
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    /// Underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caused_by: Vec<String>,
    /// Whether re-running is expected to make progress.
    pub retryable: bool,
}

impl CollectionFailure {
    pub fn new(phase: Phase, error: &MigrateError) -> Self {
        let mut caused_by = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(err) = source {
            caused_by.push(err.to_string());
            source = err.source();
        }
        Self {
            phase,
            kind: error.kind(),
            message: error.to_string(),
            caused_by,
            retryable: error.is_retryable(),
        }
    }
}

/// Result of transferring one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub collection: String,
    pub status: CollectionStatus,
    pub stats: TransferStats,
    /// Last durable boundary: where the next run resumes.
    pub resume_boundary: Option<Boundary>,
    /// Boundary of the last batch attempted, durable or not.
    pub attempted_boundary: Option<Boundary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CollectionFailure>,
}

impl CollectionOutcome {
    /// A collection that failed before the engine touched it.
    pub fn not_started(collection: impl Into<String>, error: &MigrateError) -> Self {
        Self {
            collection: collection.into(),
            status: CollectionStatus::Failed,
            stats: TransferStats::default(),
            resume_boundary: None,
            attempted_boundary: None,
            failure: Some(CollectionFailure::new(Phase::Init, error)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == CollectionStatus::Done
    }
}

/// Iteration state for one collection while it is being driven.
struct CollectionRun {
    phase: Phase,
    resume_boundary: Option<Boundary>,
    attempted_boundary: Option<Boundary>,
    stats: TransferStats,
}

impl CollectionRun {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            resume_boundary: None,
            attempted_boundary: None,
            stats: TransferStats::default(),
        }
    }

    fn finish(self, collection: &str, result: Result<()>) -> CollectionOutcome {
        let (status, failure) = match result {
            Ok(()) => (CollectionStatus::Done, None),
            Err(e) => (
                CollectionStatus::Failed,
                Some(CollectionFailure::new(self.phase, &e)),
            ),
        };
        CollectionOutcome {
            collection: collection.to_string(),
            status,
            stats: self.stats,
            resume_boundary: self.resume_boundary,
            attempted_boundary: self.attempted_boundary,
            failure,
        }
    }
}

/// Transfer engine for moving collections between stores.
pub struct TransferEngine {
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: TransferConfig,
    cancel: CancellationToken,
    /// Optional shared counter for real-time progress reporting.
    progress_counter: Option<Arc<AtomicU64>>,
}

impl TransferEngine {
    /// Create a new transfer engine over already-connected stores.
    pub fn new(
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            sink,
            checkpoints,
            config,
            cancel: CancellationToken::new(),
            progress_counter: None,
        }
    }

    /// Abort outstanding store calls when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set a shared progress counter for real-time document tracking.
    pub fn with_progress_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.progress_counter = Some(counter);
        self
    }

    /// Transfer one collection until its source is exhausted or it fails.
    ///
    /// Never returns an error: failures are captured in the outcome so the
    /// caller can continue with other collections.
    pub async fn transfer(&self, spec: &CollectionSpec) -> CollectionOutcome {
        let start = Instant::now();
        let mut run = CollectionRun::new();

        let result = self.drive(spec, &mut run).await;
        run.stats.duration_seconds = start.elapsed().as_secs_f64();

        match &result {
            Ok(()) => {
                run.phase = Phase::Done;
                info!(
                    "{}: done ({} documents in {} batches, {:.1}s)",
                    spec.name, run.stats.documents, run.stats.batches, run.stats.duration_seconds
                );
            }
            Err(e) => {
                error!(
                    "{}: failed in {:?} - {} (resume from {})",
                    spec.name,
                    run.phase,
                    e,
                    run.resume_boundary
                        .as_ref()
                        .map_or_else(|| "start".to_string(), |b| b.to_string())
                );
            }
        }
        run.finish(&spec.name, result)
    }

    async fn drive(&self, spec: &CollectionSpec, run: &mut CollectionRun) -> Result<()> {
        // Init
        spec.validate()?;
        let sort = spec.sort_spec();
        let batch_size = spec.batch_size.unwrap_or(self.config.batch_size);
        let destination = spec.destination_name();

        if !self.config.dry_run {
            self.guard(self.sink.prepare(destination)).await?;
        }

        let checkpoint = self
            .guard(self.checkpoints.get_checkpoint(&spec.name))
            .await?;
        let mut boundary = match checkpoint {
            Some(cp) => {
                if cp.sort_field != spec.sort_field {
                    return Err(MigrateError::Config(format!(
                        "checkpoint for {} was recorded for sort field '{}', not '{}'; reset it to start over",
                        spec.name, cp.sort_field, spec.sort_field
                    )));
                }
                run.stats.total_documents = cp.documents_transferred;
                let resumed = cp.boundary();
                info!(
                    "{}: resuming below {}",
                    spec.name,
                    resumed
                        .as_ref()
                        .map_or_else(|| "start".to_string(), |b| b.to_string())
                );
                resumed.or_else(|| spec.initial_value.as_ref().map(|v| Boundary::new(v.resolve())))
            }
            None => spec.initial_value.as_ref().map(|v| Boundary::new(v.resolve())),
        };
        run.resume_boundary = boundary.clone();

        debug!(
            "{}: batch size {}, sort {:?}{}",
            spec.name,
            batch_size,
            sort,
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        loop {
            run.phase = Phase::FetchPage;
            let page = self
                .guard(
                    self.source
                        .page(&spec.name, boundary.as_ref(), &sort, batch_size),
                )
                .await?;
            run.stats.pages_fetched += 1;

            if page.is_empty() {
                return Ok(());
            }

            run.phase = Phase::WriteBatch;
            let next = next_boundary(&spec.name, &page, &sort, boundary.as_ref())?;
            run.attempted_boundary = Some(next.clone());
            if sort.tie_breaker.is_none() && page.len() >= batch_size {
                warn_if_page_ends_in_tie(&spec.name, &page, &sort);
            }

            if !self.config.dry_run {
                let outcome = self.guard(self.sink.insert_batch(destination, &page)).await?;
                if !outcome.covers(page.len()) {
                    return Err(MigrateError::PartialWrite {
                        collection: spec.name.clone(),
                        submitted: page.len(),
                        written: outcome.inserted,
                    });
                }
            }

            let written = page.len() as u64;
            run.stats.documents += written;
            run.stats.batches += 1;
            run.stats.total_documents += written;
            if let Some(counter) = &self.progress_counter {
                counter.fetch_add(written, Ordering::Relaxed);
            }
            drop(page);

            run.phase = Phase::AdvanceCheckpoint;
            if !self.config.dry_run {
                let checkpoint =
                    Checkpoint::new(&spec.name, &spec.sort_field, &next, run.stats.total_documents);
                self.guard(self.checkpoints.set_checkpoint(&checkpoint))
                    .await
                    .map_err(|e| match e {
                        MigrateError::Cancelled => MigrateError::Cancelled,
                        other => MigrateError::checkpoint_write(&spec.name, other),
                    })?;
                run.stats.checkpoint_writes += 1;
                run.resume_boundary = Some(next.clone());
            }
            debug!("{}: checkpoint {} ({} documents)", spec.name, next, written);

            boundary = Some(next);
        }
    }

    /// Race a store call against cancellation.
    async fn guard<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            result = call => result,
        }
    }
}

/// Boundary for the page after `page`: the key of its last document.
///
/// The key must lie strictly below `previous`, otherwise the source broke
/// its ordering contract and paging would not terminate.
fn next_boundary(
    collection: &str,
    page: &[Document],
    sort: &SortSpec,
    previous: Option<&Boundary>,
) -> Result<Boundary> {
    let last = page
        .last()
        .ok_or_else(|| MigrateError::transfer(collection, "empty page has no boundary"))?;
    let next = Boundary::from_document(last, sort)
        .map_err(|message| MigrateError::document(collection, message))?;

    if let Some(previous) = previous {
        if !previous.admits(&next) {
            return Err(MigrateError::source(
                collection,
                format!(
                    "page ended at {} which is not below the boundary {}",
                    next, previous
                ),
            ));
        }
    }
    Ok(next)
}

/// Warn when a full page ends inside a run of equal sort values.
///
/// Without a tie breaker the next page starts strictly below that value, so
/// further documents sharing it are never fetched.
fn warn_if_page_ends_in_tie(collection: &str, page: &[Document], sort: &SortSpec) {
    let [.., before_last, last] = page else {
        return;
    };
    let (Ok(a), Ok(b)) = (
        Boundary::from_document(before_last, sort),
        Boundary::from_document(last, sort),
    ) else {
        return;
    };
    if a.value == b.value {
        warn!(
            "{}: page ended inside a group of documents with {} = {}; documents of that group beyond this page will be skipped (configure tie_breaker to avoid this)",
            collection, sort.field, b.value
        );
    }
}
