//! Per-partition dedup and atomic partition replacement.
//!
//! Ingestion appends to the raw table. Publishing a partition rebuilds it in
//! staging from the raw rows, one row per dedup key, and then swaps it into
//! the target table in a single statement. Republishing a partition with no
//! new raw rows leaves the target unchanged.

pub mod exchange;
pub mod memory;
pub mod pending;
pub mod sql;

pub use exchange::{PartitionExchange, PublishTables};
pub use memory::MemoryExchange;
pub use pending::PendingPartitions;
pub use sql::SqlExchange;

use crate::error::PublishError;
use chrono::{DateTime, Utc};
use engine_config::{Settings, SettingsError};
use engine_core::{journal::Journal, metrics::Metrics};
use model::{journal::Extensions, partition::PartitionKey, window::TimeWindow};
use serde::Serialize;
use serde_json::json;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    pub enabled: bool,
    pub gate_on_new_rows: bool,
    pub min_new_rows: u64,
    pub every_slices: u32,
    pub backfill_missing: bool,
}

impl PublishConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let p = &settings.publish;
        Self {
            enabled: p.enabled,
            gate_on_new_rows: p.gate_on_new_rows,
            min_new_rows: p.min_new_rows,
            every_slices: p.every_slices,
            backfill_missing: p.backfill_missing,
        }
    }
}

impl PublishTables {
    /// `columns` are the resolved source columns.
    pub fn from_settings(settings: &Settings, columns: Vec<String>) -> Result<Self, SettingsError> {
        Ok(Self {
            raw: settings.sink.raw_table(),
            staging: settings.sink.staging_table(),
            target: settings.sink.table.clone(),
            time_column: settings.source.time_column.clone(),
            ingested_at_column: settings.sink.ingested_at_column.clone(),
            key: settings
                .dedup
                .key
                .clone()
                .ok_or(SettingsError::Missing("dedup.key"))?,
            columns,
            tz: settings.sink.timezone,
        })
    }
}

/// Pending partitions worth publishing now. Without gating every pending
/// partition qualifies; with it only those with at least `min_new_rows` new
/// rows.
pub fn select_partitions_to_publish(
    pending: &BTreeSet<PartitionKey>,
    gate_on_new_rows: bool,
    min_new_rows: u64,
    new_rows: &BTreeMap<PartitionKey, u64>,
) -> Vec<PartitionKey> {
    pending
        .iter()
        .filter(|p| !gate_on_new_rows || new_rows.get(p).copied().unwrap_or(0) >= min_new_rows)
        .copied()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishReport {
    pub replaced: Vec<PartitionKey>,
    /// Partitions left as they were, with the reason.
    pub failed: Vec<(PartitionKey, String)>,
}

impl PublishReport {
    pub fn any_replaced(&self) -> bool {
        !self.replaced.is_empty()
    }

    pub fn merge(&mut self, other: PublishReport) {
        self.replaced.extend(other.replaced);
        self.failed.extend(other.failed);
    }
}

pub struct Publisher {
    exchange: Arc<dyn PartitionExchange>,
    progress: Option<Journal>,
    metrics: Metrics,
}

impl Publisher {
    pub fn new(exchange: Arc<dyn PartitionExchange>, metrics: Metrics) -> Self {
        Self {
            exchange,
            progress: None,
            metrics,
        }
    }

    /// Records every partition publish in `journal`, usually
    /// `journal.derive("dedup")`.
    pub fn with_progress(mut self, journal: Journal) -> Self {
        self.progress = Some(journal);
        self
    }

    pub fn tables(&self) -> &PublishTables {
        self.exchange.tables()
    }

    /// Publishes each partition on its own; a failing partition does not
    /// stop the others.
    pub async fn publish(&self, partitions: &[PartitionKey]) -> PublishReport {
        let mut report = PublishReport::default();
        for partition in partitions {
            let bounds = partition.bounds(self.tables().tz);
            self.track_start(bounds.as_ref()).await;

            match self.publish_partition(partition).await {
                Ok(()) => {
                    debug!(%partition, "Partition replaced");
                    self.track_done(bounds.as_ref(), partition).await;
                    report.replaced.push(*partition);
                }
                Err(error) => {
                    warn!(%partition, %error, "Partition publish failed, leaving target as is");
                    self.track_error(bounds.as_ref(), partition, &error).await;
                    report.failed.push((*partition, error.to_string()));
                }
            }
        }

        self.metrics
            .add_partitions_published(report.replaced.len() as u64);
        if !partitions.is_empty() {
            info!(
                table = %self.tables().target,
                replaced = report.replaced.len(),
                failed = report.failed.len(),
                "Publish finished"
            );
        }
        report
    }

    /// Publishes the pending partitions that pass the gate and drops the
    /// replaced ones from `pending`.
    pub async fn publish_pending(
        &self,
        pending: &mut PendingPartitions,
        gate_on_new_rows: bool,
        min_new_rows: u64,
    ) -> PublishReport {
        let selected = select_partitions_to_publish(
            &pending.keys(),
            gate_on_new_rows,
            min_new_rows,
            pending.counts(),
        );
        if selected.is_empty() {
            debug!(pending = pending.len(), "No partition passed the publish gate");
            return PublishReport::default();
        }
        let report = self.publish(&selected).await;
        pending.remove(&report.replaced);
        report
    }

    /// End-of-run publish: everything still pending regardless of gating,
    /// plus, with `backfill_missing`, every partition holding raw rows in
    /// `[since, until)`.
    pub async fn finalize(
        &self,
        pending: &mut PendingPartitions,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        backfill_missing: bool,
    ) -> PublishReport {
        let mut partitions = pending.keys();
        if backfill_missing {
            match TimeWindow::new(since, until) {
                Ok(window) => match self.exchange.touched_partitions(&window).await {
                    Ok(touched) => {
                        let missing = touched.iter().filter(|p| !partitions.contains(p)).count();
                        if missing > 0 {
                            info!(window = %window, missing, "Backfilling partitions missed by the publish gate");
                        }
                        partitions.extend(touched);
                    }
                    Err(error) => {
                        warn!(window = %window, %error, "Could not discover touched partitions")
                    }
                },
                Err(error) => debug!(%error, "Empty finalize range, nothing to discover"),
            }
        }

        let partitions: Vec<PartitionKey> = partitions.into_iter().collect();
        let report = self.publish(&partitions).await;
        pending.remove(&report.replaced);
        report
    }

    async fn publish_partition(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        if let Err(error) = self.exchange.clear_staging(partition).await {
            debug!(%partition, %error, "Could not clear leftover staging data");
        }

        let result = match self.exchange.stage_deduplicated(partition).await {
            Ok(()) => self.exchange.replace_partition(partition).await,
            Err(error) => Err(error),
        };

        if let Err(error) = self.exchange.clear_staging(partition).await {
            warn!(%partition, %error, "Could not clear staging after publish");
        }
        result
    }

    async fn track_start(&self, bounds: Option<&TimeWindow>) {
        let (Some(journal), Some(bounds)) = (&self.progress, bounds) else {
            return;
        };
        if let Err(error) = journal.mark_running(bounds, None, None).await {
            warn!(process = %journal.process(), window = %bounds, %error, "Could not track publish start");
        }
    }

    async fn track_done(&self, bounds: Option<&TimeWindow>, partition: &PartitionKey) {
        let (Some(journal), Some(bounds)) = (&self.progress, bounds) else {
            return;
        };
        if let Err(error) = journal
            .mark_done(bounds, 0, 0, partition_extra(partition))
            .await
        {
            warn!(process = %journal.process(), window = %bounds, %error, "Could not track publish");
        }
    }

    async fn track_error(
        &self,
        bounds: Option<&TimeWindow>,
        partition: &PartitionKey,
        error: &PublishError,
    ) {
        let (Some(journal), Some(bounds)) = (&self.progress, bounds) else {
            return;
        };
        if let Err(track) = journal
            .mark_error(bounds, &error.to_string(), "publish", partition_extra(partition))
            .await
        {
            warn!(process = %journal.process(), window = %bounds, error = %track, "Could not track publish failure");
        }
    }
}

fn partition_extra(partition: &PartitionKey) -> Extensions {
    Extensions::from([("partition_id".to_string(), json!(partition.partition_id()))])
}
