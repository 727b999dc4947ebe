use crate::error::PublishError;
use async_trait::async_trait;
use chrono_tz::Tz;
use model::{dedup::DedupKeySpec, partition::PartitionKey, window::TimeWindow};

/// The three sink tables taking part in a publish, and how their rows are
/// keyed. All three are partitioned by day of `time_column` in `tz`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishTables {
    pub raw: String,
    pub staging: String,
    pub target: String,
    pub time_column: String,
    pub ingested_at_column: String,
    pub key: DedupKeySpec,
    /// Every column of the target table; key and ingestion-time columns may
    /// be listed or not.
    pub columns: Vec<String>,
    pub tz: Tz,
}

impl PublishTables {
    /// Columns that are neither key columns nor the ingestion-time column.
    pub fn value_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.key.contains(c) && !c.eq_ignore_ascii_case(&self.ingested_at_column))
            .map(String::as_str)
            .collect()
    }

    /// Key columns, value columns, then the ingestion-time column.
    pub fn staged_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.key.columns().iter().map(String::as_str).collect();
        columns.extend(self.value_columns());
        columns.push(&self.ingested_at_column);
        columns
    }
}

/// Partition-level operations the publisher is built from.
#[async_trait]
pub trait PartitionExchange: Send + Sync {
    fn tables(&self) -> &PublishTables;

    /// Drops whatever staging holds for `partition`.
    async fn clear_staging(&self, partition: &PartitionKey) -> Result<(), PublishError>;

    /// Fills staging with one row per key from the raw rows of `partition`,
    /// carrying the most recently ingested non-null value of every column.
    async fn stage_deduplicated(&self, partition: &PartitionKey) -> Result<(), PublishError>;

    /// Swaps the target's `partition` for the staged one in a single step.
    async fn replace_partition(&self, partition: &PartitionKey) -> Result<(), PublishError>;

    /// Partitions holding raw rows with a time value inside `window`.
    async fn touched_partitions(&self, window: &TimeWindow)
    -> Result<Vec<PartitionKey>, PublishError>;
}
