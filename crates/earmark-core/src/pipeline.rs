use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::batch::{batches, Batch};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::normalize::Normalizer;
use crate::opportunity::{GrantRecord, TagSchema};
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::store::{OpportunityStore, PersistMode, WriteReport};
use crate::tagger::{CompletionClient, GrantTagger, TaggingError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load documents from the store: {0}")]
    FatalLoad(#[source] crate::Error),
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[source] crate::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why one batch failed while the rest of the run carried on.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Tagging(#[from] TaggingError),
    #[error("Persistence failed: {0}")]
    Persist(#[source] crate::Error),
    #[error("Circuit open after {0} consecutive batch failures")]
    CircuitOpen(usize),
}

/// One failed batch, kept in the run report with its identity intact.
#[derive(Debug)]
pub struct BatchFailure {
    pub batch: usize,
    pub records: usize,
    pub error: BatchError,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Upper bound on batches tagged concurrently.
    pub workers: usize,
    pub mode: PersistMode,
    pub schema: TagSchema,
    /// Mapping stamped onto every normalized record.
    pub provenance: BTreeMap<String, String>,
    /// Cap on documents taken from the store, for trial runs.
    pub limit: Option<usize>,
    pub retry: RetryPolicy,
    /// Consecutive failed batches before remaining work is short-circuited.
    /// Zero leaves every batch to run regardless of earlier failures.
    pub trip_after: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: crate::config::default_workers(),
            mode: PersistMode::Merge,
            schema: TagSchema::Core,
            provenance: BTreeMap::new(),
            limit: None,
            retry: RetryPolicy::none(),
            trip_after: 0,
        }
    }
}

/// Aggregated outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub loaded: usize,
    /// Documents dropped during normalization.
    pub skipped: usize,
    pub batches: usize,
    /// Tag records parsed out of service responses.
    pub tagged: usize,
    /// Batch records the service returned no entry for.
    pub untagged: usize,
    pub written: usize,
    /// Business ids that matched no stored document (merge mode).
    pub missed: Vec<String>,
    pub write_failures: usize,
    pub failures: Vec<BatchFailure>,
    pub duration_ms: u64,
}

impl RunReport {
    /// True when every loaded document made it through untouched by any
    /// failure path.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.skipped == 0
            && self.untagged == 0
            && self.missed.is_empty()
            && self.write_failures == 0
            && self.failures.is_empty()
    }
}

struct BatchSuccess {
    tagged: usize,
    untagged: usize,
    write: WriteReport,
}

struct BatchOutcome {
    batch: usize,
    records: usize,
    result: Result<BatchSuccess, BatchError>,
}

/// Load, normalize, batch, tag, persist. Batches run on a bounded worker
/// pool and fail independently; only the initial load can abort the run.
pub struct TaggingPipeline {
    store: Arc<dyn OpportunityStore>,
    tagger: Arc<GrantTagger>,
    config: PipelineConfig,
}

impl TaggingPipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        client: Arc<dyn CompletionClient>,
        config: PipelineConfig,
    ) -> Self {
        let tagger = Arc::new(GrantTagger::new(client, config.schema));
        Self {
            store,
            tagger,
            config,
        }
    }

    pub async fn run(&self) -> PipelineResult<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut documents = self
            .store
            .load_all()
            .await
            .map_err(PipelineError::FatalLoad)?;
        if let Some(limit) = self.config.limit {
            documents.truncate(limit);
        }
        let loaded = documents.len();
        tracing::info!(documents = loaded, "loaded documents from store");

        let normalizer = Normalizer::new(self.config.provenance.clone());
        let mut records = Vec::with_capacity(documents.len());
        let mut skipped = 0usize;
        for document in &documents {
            match normalizer.normalize(document) {
                Ok(record) => records.push(record),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(
                        document = document.id,
                        error = %err,
                        "skipping unparseable document"
                    );
                }
            }
        }
        tracing::info!(records = records.len(), skipped, "normalized documents");

        let work: Vec<Batch<GrantRecord>> = batches(records, self.config.batch_size)
            .map_err(PipelineError::Config)?
            .collect();
        let total_batches = work.len();
        let workers = self.config.workers.max(1);
        tracing::info!(
            batches = total_batches,
            batch_size = self.config.batch_size,
            workers,
            mode = %self.config.mode,
            "tagging"
        );

        let breaker = CircuitBreaker::new(self.config.trip_after);
        let breaker_ref = &breaker;
        let outcomes: Vec<BatchOutcome> = stream::iter(
            work.into_iter()
                .map(|batch| async move { self.process_batch(batch, breaker_ref).await }),
        )
        .buffer_unordered(workers)
        .collect()
        .await;

        let mut report = RunReport {
            started_at,
            loaded,
            skipped,
            batches: total_batches,
            tagged: 0,
            untagged: 0,
            written: 0,
            missed: Vec::new(),
            write_failures: 0,
            failures: Vec::new(),
            duration_ms: 0,
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(success) => {
                    report.tagged += success.tagged;
                    report.untagged += success.untagged;
                    report.written += success.write.written;
                    report.missed.extend(success.write.missed);
                    report.write_failures += success.write.failed.len();
                }
                Err(error) => report.failures.push(BatchFailure {
                    batch: outcome.batch,
                    records: outcome.records,
                    error,
                }),
            }
        }
        report.missed.sort_unstable();
        report.failures.sort_by_key(|f| f.batch);
        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::info!(
            written = report.written,
            skipped = report.skipped,
            failed_batches = report.failures.len(),
            duration_ms = report.duration_ms,
            "run finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        batch: Batch<GrantRecord>,
        breaker: &CircuitBreaker,
    ) -> BatchOutcome {
        let index = batch.index;
        let records = batch.records.len();

        if breaker.is_open() {
            tracing::warn!(batch = index, "circuit open, skipping batch");
            return BatchOutcome {
                batch: index,
                records,
                result: Err(BatchError::CircuitOpen(self.config.trip_after)),
            };
        }

        let tags = match self.config.retry.run(|| self.tagger.tag_batch(&batch)).await {
            Ok(tags) => tags,
            Err(err) => {
                breaker.record_failure();
                tracing::warn!(batch = index, error = %err, "batch tagging failed");
                return BatchOutcome {
                    batch: index,
                    records,
                    result: Err(BatchError::Tagging(err)),
                };
            }
        };

        let returned: HashSet<&str> = tags.iter().map(|t| t.business_id.as_str()).collect();
        let untagged = batch
            .records
            .iter()
            .filter(|r| {
                !r.business_id
                    .as_deref()
                    .is_some_and(|id| returned.contains(id))
            })
            .count();
        if untagged > 0 {
            tracing::warn!(batch = index, untagged, "records missing from the response");
        }

        match self.store.apply_tags(&tags, self.config.mode).await {
            Ok(write) => {
                breaker.record_success();
                tracing::debug!(batch = index, written = write.written, "batch persisted");
                BatchOutcome {
                    batch: index,
                    records,
                    result: Ok(BatchSuccess {
                        tagged: tags.len(),
                        untagged,
                        write,
                    }),
                }
            }
            Err(err) => {
                breaker.record_failure();
                tracing::warn!(batch = index, error = %err, "batch persistence failed");
                BatchOutcome {
                    batch: index,
                    records,
                    result: Err(BatchError::Persist(err)),
                }
            }
        }
    }
}
