use super::{
    bootstrap::{check_sink_tables, resolve_columns},
    report::{RunOutcome, RunReport, SliceFailure},
};
use crate::error::RunError;
use chrono::{DateTime, TimeDelta, Utc};
use connectors::{sink::Sink, source::Source};
use engine_config::Settings;
use engine_core::{
    clock::Clock,
    journal::{Journal, SanitizePolicy},
    metrics::Metrics,
    retry::RetryPolicy,
    slicer::{self, SplitPolicy},
};
use engine_processing::{
    ingest::{IngestConfig, SliceIngestor},
    publish::{
        PartitionExchange, PendingPartitions, PublishConfig, PublishReport, PublishTables,
        Publisher, SqlExchange,
    },
    writer::SinkWriter,
};
use model::{journal::Extensions, partition::PartitionKey};
use serde_json::json;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{error, info, warn};

/// Process state key holding the ids of partitions a run could not publish.
pub const UNPUBLISHED_PARTITIONS: &str = "unpublished_partitions";

/// Explicit run bounds. Without `since` the run resumes from the watermark;
/// without `until` it stops `lag` behind now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunBounds {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub step: TimeDelta,
    pub lag: TimeDelta,
    pub start_at: Option<DateTime<Utc>>,
    pub split: SplitPolicy,
    pub sanitize: SanitizePolicy,
    pub retry: RetryPolicy,
    pub ingest: IngestConfig,
    pub publish: PublishConfig,
    pub target_table: String,
    pub staging_table: String,
    pub host: Option<String>,
}

impl RuntimeConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, RunError> {
        Ok(Self {
            step: settings.step(),
            lag: settings.lag(),
            start_at: settings.source.start_at,
            split: settings.split_policy(),
            sanitize: settings.sanitize_policy(),
            retry: settings.retry_policy(),
            ingest: IngestConfig::from_settings(settings)?,
            publish: PublishConfig::from_settings(settings),
            target_table: settings.sink.table.clone(),
            staging_table: settings.sink.staging_table(),
            host: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
        })
    }
}

type ExchangeFactory = Box<dyn Fn(PublishTables) -> Arc<dyn PartitionExchange> + Send + Sync>;

/// What bootstrap resolves once per orchestrator.
struct Pipeline {
    ingestor: SliceIngestor,
    publisher: Publisher,
    dedup_journal: Journal,
}

/// Drives runs for one process: lock, recover, slice, ingest, publish.
/// Metrics in a report cover the orchestrator's lifetime.
pub struct Orchestrator {
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    metrics: Metrics,
    exchange: Option<ExchangeFactory>,
    pipeline: Option<Pipeline>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            source,
            sink,
            journal,
            clock,
            config,
            metrics: Metrics::new(),
            exchange: None,
            pipeline: None,
        }
    }

    /// Publishes through `factory` instead of ClickHouse SQL over the sink.
    pub fn with_exchange<F>(mut self, factory: F) -> Self
    where
        F: Fn(PublishTables) -> Arc<dyn PartitionExchange> + Send + Sync + 'static,
    {
        self.exchange = Some(Box::new(factory));
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Ensures the journal schema, checks the sink tables and resolves the
    /// source columns. Runs on the first `run` when not called before.
    pub async fn bootstrap(&mut self) -> Result<(), RunError> {
        if self.pipeline.is_some() {
            return Ok(());
        }

        self.journal
            .ensure()
            .await
            .map_err(|e| RunError::bootstrap("journal ensure", e))?;
        let dedup_journal = self.journal.derive("dedup");

        let mut ingest = self.config.ingest.clone();
        check_sink_tables(
            self.sink.as_ref(),
            &[
                ingest.raw_table.as_str(),
                self.config.staging_table.as_str(),
                self.config.target_table.as_str(),
            ],
        )
        .await?;
        ingest.columns = resolve_columns(self.source.as_ref(), &ingest).await?;

        let tables = PublishTables {
            raw: ingest.raw_table.clone(),
            staging: self.config.staging_table.clone(),
            target: self.config.target_table.clone(),
            time_column: ingest.time_column.clone(),
            ingested_at_column: ingest.ingested_at_column.clone(),
            key: ingest.dedup_key.clone(),
            columns: ingest.columns.clone(),
            tz: ingest.partition_tz,
        };
        let exchange: Arc<dyn PartitionExchange> = match &self.exchange {
            Some(factory) => factory(tables),
            None => Arc::new(SqlExchange::new(Arc::clone(&self.sink), tables)),
        };
        let publisher = Publisher::new(exchange, self.metrics.clone())
            .with_progress(self.journal.derive("dedup"));

        let writer = SinkWriter::new(
            Arc::clone(&self.sink),
            &ingest.raw_table,
            ingest.sink_columns(),
            self.config.retry.clone(),
            self.metrics.clone(),
        );
        info!(
            process = %self.journal.process(),
            source = %ingest.source_table,
            raw = %ingest.raw_table,
            target = %self.config.target_table,
            columns = ingest.columns.len(),
            "Bootstrap complete"
        );
        let ingestor = SliceIngestor::new(
            Arc::clone(&self.source),
            writer,
            Arc::clone(&self.journal),
            Arc::clone(&self.clock),
            self.metrics.clone(),
            ingest,
        );

        self.pipeline = Some(Pipeline {
            ingestor,
            publisher,
            dedup_journal,
        });
        Ok(())
    }

    pub async fn run(&mut self, bounds: RunBounds) -> Result<RunReport, RunError> {
        let process = self.journal.process().to_string();
        if !self.journal.try_acquire_exclusive_lock().await? {
            info!(process = %process, "Another instance holds the lock, exiting");
            let mut report = RunReport::new(&process, RunOutcome::LockNotAcquired);
            report.metrics = self.metrics.snapshot();
            return Ok(report);
        }

        let result = self.run_locked(bounds).await;
        if let Err(error) = self.journal.release().await {
            warn!(process = %process, %error, "Failed to release run lock");
        }
        if let Err(error) = &result {
            error!(process = %process, %error, "Run aborted");
        }
        result
    }

    async fn run_locked(&mut self, bounds: RunBounds) -> Result<RunReport, RunError> {
        self.bootstrap().await?;
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(RunError::bootstrap("bootstrap", "pipeline missing"));
        };
        let journal = &self.journal;
        let process = journal.process().to_string();
        let config = &self.config;

        let mut report = RunReport::new(&process, RunOutcome::Completed);
        report.sanitized = journal.sanitize_stale(&config.sanitize).await;
        let dedup_sanitized = pipeline.dedup_journal.sanitize_stale(&config.sanitize).await;
        if dedup_sanitized.total() > 0 {
            info!(process = %pipeline.dedup_journal.process(), reclaimed = dedup_sanitized.total(), "Reclaimed stale publish records");
        }
        report.pruned = journal.maybe_prune().await;
        pipeline.ingestor.reset_dedup().await;

        let watermark = journal.get_watermark().await?;
        let since = bounds
            .since
            .or(watermark)
            .or(config.start_at)
            .ok_or_else(|| RunError::NoStartingPoint(process.clone()))?;
        let until = bounds
            .until
            .unwrap_or_else(|| self.clock.now() - config.lag);
        report.since = Some(since);
        report.until = Some(until);

        if since >= until {
            info!(process = %process, since = %since, until = %until, "Watermark is current, nothing to do");
            report.outcome = RunOutcome::NothingToDo;
            report.watermark = watermark;
            report.metrics = self.metrics.snapshot();
            return Ok(report);
        }

        let windows: Vec<_> = slicer::generate(since, until, config.step)?.collect();
        report.slices_planned = windows.len();
        info!(
            process = %process,
            since = %since,
            until = %until,
            slices = windows.len(),
            "Run started"
        );

        let mut pending = PendingPartitions::new();
        if config.publish.enabled {
            let carried = unpublished_partitions(journal).await;
            if !carried.is_empty() {
                info!(process = %process, partitions = carried.len(), "Carrying over partitions an earlier run left unpublished");
            }
            for partition in carried {
                pending.add(partition, 0);
            }
        }
        let mut published = PublishReport::default();
        let mut done_until = since;
        let pid = i32::try_from(std::process::id()).ok();

        for window in windows {
            journal.mark_planned(&window).await?;
            journal
                .mark_running(&window, config.host.as_deref(), pid)
                .await?;

            match pipeline.ingestor.ingest(window, &config.split).await {
                Ok(slice) => {
                    let extra = Extensions::from([
                        ("duplicates".to_string(), json!(slice.duplicates)),
                        ("rejected".to_string(), json!(slice.rejected)),
                        ("splits".to_string(), json!(slice.splits)),
                    ]);
                    journal
                        .mark_done(&window, slice.rows_read, slice.rows_written, extra)
                        .await?;
                    self.metrics.slice_ok();
                    pending.add_all(&slice.partitions);
                    report.slices_done += 1;
                    done_until = window.to;

                    let every = config.publish.every_slices as usize;
                    if config.publish.enabled && every > 0 && report.slices_done % every == 0 {
                        published.merge(
                            pipeline
                                .publisher
                                .publish_pending(
                                    &mut pending,
                                    config.publish.gate_on_new_rows,
                                    config.publish.min_new_rows,
                                )
                                .await,
                        );
                    }
                }
                Err(err) => {
                    self.metrics.slice_failed();
                    error!(process = %process, window = %window, error = %err, "Slice failed, stopping run");
                    journal
                        .mark_error(&window, &err.to_string(), "ingest", Extensions::new())
                        .await?;
                    report.failure = Some(SliceFailure {
                        window,
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }

        if config.publish.enabled {
            let last = pipeline
                .publisher
                .finalize(
                    &mut pending,
                    since,
                    done_until,
                    config.publish.backfill_missing,
                )
                .await;
            let mut left = pending.keys();
            left.extend(last.failed.iter().map(|(partition, _)| *partition));
            published.merge(last);

            if !left.is_empty() {
                warn!(
                    process = %process,
                    partitions = left.len(),
                    "Partitions left unpublished, recorded for the next run"
                );
            }
            record_unpublished(journal, &left).await;
        }

        report.published = published.replaced;
        report.publish_failures = published.failed;
        report.watermark = journal.get_watermark().await?;
        report.metrics = self.metrics.snapshot();
        info!(
            process = %process,
            slices = report.slices_done,
            published = report.published.len(),
            watermark = ?report.watermark,
            success = report.is_success(),
            "Run finished"
        );
        Ok(report)
    }
}

/// Partitions recorded by [`record_unpublished`]. Unreadable state counts as
/// none.
async fn unpublished_partitions(journal: &Journal) -> Vec<PartitionKey> {
    let state = match journal.state().await {
        Ok(state) => state,
        Err(error) => {
            warn!(process = %journal.process(), %error, "Could not read unpublished partitions");
            return Vec::new();
        }
    };
    state
        .and_then(|s| s.extra.get(UNPUBLISHED_PARTITIONS).cloned())
        .and_then(|ids| ids.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|id| id.as_str().and_then(PartitionKey::from_partition_id))
        .collect()
}

/// Overwrites the recorded set, so an empty `left` clears it.
async fn record_unpublished(journal: &Journal, left: &BTreeSet<PartitionKey>) {
    let ids: Vec<String> = left.iter().map(PartitionKey::partition_id).collect();
    journal
        .annotate(Extensions::from([(
            UNPUBLISHED_PARTITIONS.to_string(),
            json!(ids),
        )]))
        .await;
}
