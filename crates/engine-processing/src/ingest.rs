//! Moves one window from the source into the sink's raw table.

use crate::{
    buffer::{BufferedRows, RowBuffer},
    dedup::RunDedup,
    error::IngestError,
    writer::SinkWriter,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use connectors::{
    clickhouse::encode::coerce_for_sink,
    source::{FetchRequest, Source},
};
use engine_config::{Settings, SettingsError};
use engine_core::{
    clock::Clock,
    journal::Journal,
    metrics::Metrics,
    slicer::{SplitPolicy, adaptive_split},
};
use futures::StreamExt;
use model::{
    core::{time::normalize, value::Value},
    dedup::DedupKeySpec,
    partition::PartitionKey,
    records::row::RowData,
    window::TimeWindow,
};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub source_table: String,
    pub time_column: String,
    /// Empty means every column the source returns.
    pub columns: Vec<String>,
    pub raw_table: String,
    pub ingested_at_column: String,
    pub batch_size: usize,
    pub partition_tz: Tz,
    pub dedup_key: DedupKeySpec,
}

impl IngestConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self {
            source_table: settings.source.table.clone(),
            time_column: settings.source.time_column.clone(),
            columns: settings.source.columns.clone(),
            raw_table: settings.sink.raw_table(),
            ingested_at_column: settings.sink.ingested_at_column.clone(),
            batch_size: settings.sink.batch_size,
            partition_tz: settings.sink.timezone,
            dedup_key: settings
                .dedup
                .key
                .clone()
                .ok_or(SettingsError::Missing("dedup.key"))?,
        })
    }

    /// Columns written to the raw table: the source columns followed by the
    /// ingestion-time column.
    pub fn sink_columns(&self) -> Vec<String> {
        let mut columns = self.columns.clone();
        if !columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.ingested_at_column))
        {
            columns.push(self.ingested_at_column.clone());
        }
        columns
    }
}

/// Counts for one ingested window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceIngest {
    pub rows_read: u64,
    pub rows_written: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Rows written per partition.
    pub partitions: BTreeMap<PartitionKey, u64>,
    pub splits: u32,
    pub leaves: usize,
}

impl SliceIngest {
    fn merge(&mut self, other: SliceIngest) {
        self.rows_read += other.rows_read;
        self.rows_written += other.rows_written;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        for (partition, rows) in other.partitions {
            *self.partitions.entry(partition).or_default() += rows;
        }
    }
}

pub struct SliceIngestor {
    source: Arc<dyn Source>,
    writer: SinkWriter,
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    config: IngestConfig,
    dedup: Mutex<RunDedup>,
}

impl SliceIngestor {
    /// `config.columns` must already be resolved because they shape the
    /// writer's column list.
    pub fn new(
        source: Arc<dyn Source>,
        writer: SinkWriter,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: IngestConfig,
    ) -> Self {
        let dedup = Mutex::new(RunDedup::new(config.dedup_key.clone()));
        Self {
            source,
            writer,
            journal,
            clock,
            metrics,
            config,
            dedup,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Starts a new dedup scope; keys seen before are admitted again.
    pub async fn reset_dedup(&self) {
        *self.dedup.lock().await = RunDedup::new(self.config.dedup_key.clone());
    }

    /// Ingests `window`, splitting it while the source reports overload.
    pub async fn ingest(
        &self,
        window: TimeWindow,
        policy: &SplitPolicy,
    ) -> Result<SliceIngest, IngestError> {
        let outcome = adaptive_split(window, policy, |leaf| self.ingest_leaf(leaf)).await?;
        if outcome.splits > 0 {
            info!(
                window = %window,
                splits = outcome.splits,
                depth = outcome.deepest,
                leaves = outcome.leaves.len(),
                "Window split under source overload"
            );
            self.metrics.add_splits(u64::from(outcome.splits));
        }

        let mut total = SliceIngest {
            splits: outcome.splits,
            leaves: outcome.leaves.len(),
            ..Default::default()
        };
        for (_, leaf) in outcome.leaves {
            total.merge(leaf);
        }
        Ok(total)
    }

    /// One fetch of one window, no splitting.
    pub async fn ingest_leaf(&self, window: TimeWindow) -> Result<SliceIngest, IngestError> {
        let request = FetchRequest::new(
            &self.config.source_table,
            &self.config.time_column,
            self.config.columns.clone(),
            window,
        );
        let mut stream = self.source.fetch_increment(&request).await?;
        let mut buffer = RowBuffer::new(self.config.batch_size);
        let mut report = SliceIngest::default();

        while let Some(batch) = stream.next().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    let pending = buffer.take();
                    self.discard(pending, &window).await;
                    return Err(err.into());
                }
            };

            let ingested_at = self.clock.now();
            for row in batch {
                report.rows_read += 1;
                let Some((row, ts)) = self.prepare(row, ingested_at) else {
                    report.rejected += 1;
                    continue;
                };
                let Some(key) = self.dedup.lock().await.admit(&row) else {
                    report.duplicates += 1;
                    continue;
                };
                let partition = PartitionKey::for_instant(&ts, self.config.partition_tz);
                if buffer.push(row, key, partition) {
                    self.flush(buffer.take(), &window, &mut report).await?;
                }
            }
        }
        if !buffer.is_empty() {
            self.flush(buffer.take(), &window, &mut report).await?;
        }

        self.metrics.add_rows_read(report.rows_read);
        self.metrics.add_duplicates(report.duplicates);
        self.metrics.add_rejected(report.rejected);
        debug!(
            window = %window,
            read = report.rows_read,
            written = report.rows_written,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Window ingested"
        );
        Ok(report)
    }

    /// Normalizes the time column, coerces values for the sink and stamps the
    /// ingestion time. `None` when the row has no usable time value.
    fn prepare(&self, row: RowData, ingested_at: DateTime<Utc>) -> Option<(RowData, DateTime<Utc>)> {
        let ts = match normalize(&row.get_value(&self.config.time_column)) {
            Ok(ts) => ts,
            Err(error) => {
                debug!(column = %self.config.time_column, %error, "Rejected row without usable time");
                return None;
            }
        };

        let mut row = RowData {
            entity: row.entity,
            field_values: row
                .field_values
                .into_iter()
                .map(|mut field| {
                    field.value = field.value.map(coerce_for_sink);
                    field
                })
                .collect(),
        };
        row.set(&self.config.time_column, Value::Timestamp(ts));
        row.set(&self.config.ingested_at_column, Value::Timestamp(ingested_at));
        Some((row, ts))
    }

    async fn flush(
        &self,
        pending: BufferedRows,
        window: &TimeWindow,
        report: &mut SliceIngest,
    ) -> Result<(), IngestError> {
        match self.writer.write(&pending.rows).await {
            Ok(written) => {
                report.rows_written += written;
                self.metrics.add_rows_written(written);
                for (partition, rows) in pending.partitions {
                    *report.partitions.entry(partition).or_default() += rows;
                }

                let progress = json!({
                    "slice_from": window.from,
                    "slice_to": window.to,
                    "rows_read": report.rows_read,
                    "rows_written": report.rows_written,
                });
                if self.journal.heartbeat(Some(progress)).await {
                    self.metrics.heartbeat();
                }
                Ok(())
            }
            Err(err) => {
                self.discard(pending, window).await;
                Err(err)
            }
        }
    }

    /// Drops rows that never reached the sink so a re-fetch admits them
    /// again.
    async fn discard(&self, pending: BufferedRows, window: &TimeWindow) {
        if pending.keys.is_empty() {
            return;
        }
        warn!(window = %window, rows = pending.keys.len(), "Discarding unflushed rows");
        self.dedup.lock().await.forget(&pending.keys);
    }
}
