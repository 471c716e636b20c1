//! Transfer orchestrator - runs every configured collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CollectionSpec, Config};
use crate::core::{RecordSink, RecordSource};
use crate::drivers;
use crate::error::{MigrateError, Result};
use crate::state::{Checkpoint, CheckpointStore};
use crate::transfer::{CollectionOutcome, TransferConfig, TransferEngine};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
    dry_run: bool,
    /// Collections selected for this run, in configuration order.
    selected: Vec<CollectionSpec>,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every collection reached `Done`.
    Completed,
    /// At least one collection failed.
    Failed,
    /// The run was cancelled before every collection finished.
    Cancelled,
}

/// Result of a transfer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA-256 of the configuration used.
    pub config_hash: String,

    /// Final status.
    pub status: RunStatus,

    /// Whether writes were skipped.
    pub dry_run: bool,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Collections processed.
    pub collections_total: usize,

    /// Collections that reached `Done`.
    pub collections_done: usize,

    /// Collections that failed.
    pub collections_failed: usize,

    /// Documents written in this run.
    pub documents_transferred: u64,

    /// Names of failed collections.
    pub failed_collections: Vec<String>,

    /// Per-collection outcomes in configuration order.
    pub collections: Vec<CollectionOutcome>,
}

impl TransferReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn has_failures(&self) -> bool {
        self.collections_failed > 0
    }
}

/// Checkpoint state of one configured collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCheckpoint {
    pub collection: String,
    pub checkpoint: Option<Checkpoint>,
}

impl Orchestrator {
    /// Connect the configured stores and create an orchestrator.
    pub async fn connect(config: Config) -> Result<Self> {
        let source = drivers::connect_source(&config.source).await?;
        let sink = drivers::connect_sink(&config.destination).await?;
        let checkpoints = drivers::connect_checkpoints(&config.checkpoint).await?;
        Ok(Self::from_parts(config, source, sink, checkpoints))
    }

    /// Create an orchestrator over already-connected stores.
    pub fn from_parts(
        config: Config,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let selected = config.collections.clone();
        Self {
            config,
            source,
            sink,
            checkpoints,
            cancel: CancellationToken::new(),
            dry_run: false,
            selected,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Restrict the run to the named collections.
    ///
    /// Configuration order is kept; unknown names are a configuration error.
    pub fn with_collections<S: AsRef<str>>(mut self, names: &[S]) -> Result<Self> {
        let wanted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        if wanted.is_empty() {
            return Ok(self);
        }
        if let Some(unknown) = wanted
            .iter()
            .find(|n| self.config.collection(n).is_none())
        {
            return Err(MigrateError::Config(format!(
                "collection '{}' is not configured",
                unknown
            )));
        }
        self.selected = self
            .config
            .collections
            .iter()
            .filter(|c| wanted.contains(&c.name.as_str()))
            .cloned()
            .collect();
        Ok(self)
    }

    /// Override the global batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MigrateError::Config("batch size must be at least 1".into()));
        }
        self.config.transfer.batch_size = batch_size;
        Ok(self)
    }

    /// Override how many collections run at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(MigrateError::Config("concurrency must be at least 1".into()));
        }
        self.config.transfer.concurrency = concurrency;
        Ok(self)
    }

    /// Run the transfer for every selected collection.
    ///
    /// Collection failures are reported in the result, not returned as
    /// errors. `Err` means the run could not start.
    pub async fn run(self) -> Result<TransferReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting transfer run {} ({} collections, source: {}, destination: {}, checkpoints: {}{})",
            run_id,
            self.selected.len(),
            self.source.source_type(),
            self.sink.sink_type(),
            self.checkpoints.backend_type(),
            if self.dry_run { ", dry run" } else { "" }
        );

        self.checkpoints.ensure_ready().await?;

        let progress = Arc::new(AtomicU64::new(0));
        let engine = Arc::new(
            TransferEngine::new(
                self.source.clone(),
                self.sink.clone(),
                self.checkpoints.clone(),
                TransferConfig {
                    batch_size: self.config.transfer.batch_size,
                    dry_run: self.dry_run,
                },
            )
            .with_cancellation(self.cancel.clone())
            .with_progress_counter(progress.clone()),
        );

        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(report_progress(progress.clone(), reporter_stop.clone()));

        let outcomes = self.transfer_collections(engine).await;

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            debug!("Progress reporter ended abnormally: {}", e);
        }

        let completed_at = Utc::now();
        let failed_collections: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_done())
            .map(|o| o.collection.clone())
            .collect();
        let status = if self.cancel.is_cancelled() && !failed_collections.is_empty() {
            RunStatus::Cancelled
        } else if failed_collections.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let report = TransferReport {
            run_id,
            config_hash: self.config.hash(),
            status,
            dry_run: self.dry_run,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            collections_total: outcomes.len(),
            collections_done: outcomes.len() - failed_collections.len(),
            collections_failed: failed_collections.len(),
            documents_transferred: outcomes.iter().map(|o| o.stats.documents).sum(),
            failed_collections,
            collections: outcomes,
        };

        info!(
            "Transfer run {} {:?}: {}/{} collections done, {} documents",
            report.run_id,
            report.status,
            report.collections_done,
            report.collections_total,
            report.documents_transferred
        );
        Ok(report)
    }

    /// Schedule collections on the worker semaphore, keeping result order.
    async fn transfer_collections(&self, engine: Arc<TransferEngine>) -> Vec<CollectionOutcome> {
        let workers = self.config.transfer.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: Vec<BoxFuture<'static, CollectionOutcome>> = Vec::with_capacity(self.selected.len());

        info!(
            "Transferring {} collections with {} workers",
            self.selected.len(),
            workers
        );

        for spec in &self.selected {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                warn!("{}: not started, transfer cancelled", spec.name);
                let outcome = CollectionOutcome::not_started(&spec.name, &MigrateError::Cancelled);
                tasks.push(future::ready(outcome).boxed());
                continue;
            };

            let engine = engine.clone();
            let spec = spec.clone();
            let name = spec.name.clone();
            let handle = tokio::spawn(async move {
                let outcome = engine.transfer(&spec).await;
                drop(permit);
                outcome
            });

            tasks.push(
                async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => CollectionOutcome::not_started(
                            &name,
                            &MigrateError::transfer(&name, format!("task panicked: {}", e)),
                        ),
                    }
                }
                .boxed(),
            );
        }

        future::join_all(tasks).await
    }

    /// Checkpoints of the selected collections.
    pub async fn status(&self) -> Result<Vec<CollectionCheckpoint>> {
        self.checkpoints.ensure_ready().await?;
        let mut rows = Vec::with_capacity(self.selected.len());
        for spec in &self.selected {
            rows.push(CollectionCheckpoint {
                collection: spec.name.clone(),
                checkpoint: self.checkpoints.get_checkpoint(&spec.name).await?,
            });
        }
        Ok(rows)
    }

    /// Delete the checkpoints of the selected collections so the next run
    /// starts from `initial_value`. Returns the collections that had one.
    pub async fn reset(&self) -> Result<Vec<String>> {
        self.checkpoints.ensure_ready().await?;
        let mut deleted = Vec::new();
        for spec in &self.selected {
            if self.checkpoints.delete_checkpoint(&spec.name).await? {
                info!("{}: checkpoint deleted", spec.name);
                deleted.push(spec.name.clone());
            } else {
                debug!("{}: no checkpoint to delete", spec.name);
            }
        }
        Ok(deleted)
    }
}

/// Log the shared document counter until `stop` is cancelled.
async fn report_progress(counter: Arc<AtomicU64>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
    // First tick fires immediately
    interval.tick().await;
    let mut last = 0;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {
                let current = counter.load(Ordering::Relaxed);
                if current != last {
                    info!("Progress: {} documents transferred", current);
                    last = current;
                }
            }
        }
    }
}
