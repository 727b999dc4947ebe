//! Publish steps over [`MemorySink`] tables, for tests and dry runs.

use super::exchange::{PartitionExchange, PublishTables};
use crate::error::{PublishError, PublishStep};
use async_trait::async_trait;
use connectors::{error::SinkError, memory::MemorySink};
use model::{
    core::{time::normalize, value::Value},
    dedup::DedupKey,
    partition::PartitionKey,
    records::row::RowData,
    window::TimeWindow,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

pub struct MemoryExchange {
    sink: Arc<MemorySink>,
    tables: PublishTables,
    failures: Mutex<Vec<(PublishStep, Option<PartitionKey>)>>,
}

impl MemoryExchange {
    pub fn new(sink: Arc<MemorySink>, tables: PublishTables) -> Self {
        Self {
            sink,
            tables,
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Builder form of [`MemoryExchange::fail_on`].
    pub fn with_failure(mut self, step: PublishStep, partition: Option<PartitionKey>) -> Self {
        self.failures.get_mut().push((step, partition));
        self
    }

    /// Makes `step` fail for `partition`, or for every partition when `None`,
    /// until [`MemoryExchange::clear_failures`].
    pub async fn fail_on(&self, step: PublishStep, partition: Option<PartitionKey>) {
        self.failures.lock().await.push((step, partition));
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    async fn check(&self, step: PublishStep, partition: &PartitionKey) -> Result<(), PublishError> {
        let failing = self
            .failures
            .lock()
            .await
            .iter()
            .any(|(s, p)| *s == step && p.is_none_or(|p| p == *partition));
        if failing {
            return Err(PublishError::Step {
                step,
                partition: partition.partition_id(),
                source: SinkError::Server {
                    code: Some(0),
                    status: 500,
                    message: "injected failure".to_string(),
                },
            });
        }
        Ok(())
    }

    fn partition_of(&self, row: &RowData) -> Option<PartitionKey> {
        normalize(&row.get_value(&self.tables.time_column))
            .ok()
            .map(|ts| PartitionKey::for_instant(&ts, self.tables.tz))
    }

    fn ingested_at(&self, row: &RowData) -> Value {
        row.get_value(&self.tables.ingested_at_column)
    }

    /// Folds the raw rows of one partition into one row per key, in order of
    /// first appearance.
    fn deduplicate(&self, raw: Vec<RowData>, partition: &PartitionKey) -> Vec<RowData> {
        let t = &self.tables;
        let mut order: Vec<DedupKey> = Vec::new();
        let mut groups: HashMap<DedupKey, Vec<RowData>> = HashMap::new();
        for row in raw {
            if self.partition_of(&row) != Some(*partition) {
                continue;
            }
            let key = t.key.key_of(&row);
            let group = groups.entry(key).or_default();
            if group.is_empty() {
                order.push(key);
            }
            group.push(row);
        }

        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .map(|mut group| {
                // stable, so the later row wins a tie
                group.sort_by(|a, b| {
                    self.ingested_at(a)
                        .compare(&self.ingested_at(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut merged = RowData::new(&group[0].entity, vec![]);
                for column in t.staged_columns() {
                    let value = if t.key.contains(column) {
                        group[0].get_value(column)
                    } else {
                        group
                            .iter()
                            .rev()
                            .map(|r| r.get_value(column))
                            .find(|v| !v.is_null())
                            .unwrap_or(Value::Null)
                    };
                    merged.set(column, value);
                }
                merged
            })
            .collect()
    }

    async fn without_partition(&self, table: &str, partition: &PartitionKey) -> Vec<RowData> {
        self.sink
            .rows(table)
            .await
            .into_iter()
            .filter(|row| self.partition_of(row) != Some(*partition))
            .collect()
    }
}

#[async_trait]
impl PartitionExchange for MemoryExchange {
    fn tables(&self) -> &PublishTables {
        &self.tables
    }

    async fn clear_staging(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        self.check(PublishStep::ClearStaging, partition).await?;
        let kept = self.without_partition(&self.tables.staging, partition).await;
        self.sink.set_rows(&self.tables.staging, kept).await;
        Ok(())
    }

    async fn stage_deduplicated(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        self.check(PublishStep::Stage, partition).await?;
        let staged = self.deduplicate(self.sink.rows(&self.tables.raw).await, partition);
        let mut staging = self.sink.rows(&self.tables.staging).await;
        staging.extend(staged);
        self.sink.set_rows(&self.tables.staging, staging).await;
        Ok(())
    }

    async fn replace_partition(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        self.check(PublishStep::Replace, partition).await?;
        let staged: Vec<RowData> = self
            .sink
            .rows(&self.tables.staging)
            .await
            .into_iter()
            .filter(|row| self.partition_of(row) == Some(*partition))
            .collect();
        let mut target = self.without_partition(&self.tables.target, partition).await;
        target.extend(staged);
        self.sink.set_rows(&self.tables.target, target).await;
        Ok(())
    }

    async fn touched_partitions(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<PartitionKey>, PublishError> {
        let mut found: Vec<PartitionKey> = self
            .sink
            .rows(&self.tables.raw)
            .await
            .iter()
            .filter_map(|row| {
                let ts = normalize(&row.get_value(&self.tables.time_column)).ok()?;
                window
                    .contains(&ts)
                    .then(|| PartitionKey::for_instant(&ts, self.tables.tz))
            })
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }
}
