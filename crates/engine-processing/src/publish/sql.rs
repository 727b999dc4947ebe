//! Publish steps as ClickHouse statements over the sink's HTTP interface.

use super::exchange::{PartitionExchange, PublishTables};
use crate::error::{PublishError, PublishStep};
use async_trait::async_trait;
use connectors::{clickhouse::encode::format_datetime64, sink::Sink};
use model::{
    core::{
        utils::{quote_ident, quote_literal, quote_table},
        value::Value,
    },
    partition::PartitionKey,
    window::TimeWindow,
};
use std::sync::Arc;
use tracing::debug;

pub struct SqlExchange {
    sink: Arc<dyn Sink>,
    tables: PublishTables,
}

impl SqlExchange {
    pub fn new(sink: Arc<dyn Sink>, tables: PublishTables) -> Self {
        Self { sink, tables }
    }

    pub fn clear_staging_sql(&self, partition: &PartitionKey) -> String {
        format!(
            "ALTER TABLE {} DROP PARTITION ID {}",
            quote_table(&self.tables.staging),
            quote_literal(&partition.partition_id())
        )
    }

    /// Columns are matched by position, so the select list carries no
    /// aliases.
    pub fn stage_sql(&self, partition: &PartitionKey) -> String {
        let t = &self.tables;
        let version = quote_ident(&t.ingested_at_column);
        let keys: Vec<String> = t.key.columns().iter().map(|c| quote_ident(c)).collect();

        let mut select = keys.clone();
        select.extend(
            t.value_columns()
                .into_iter()
                .map(|c| format!("argMax({}, {version})", quote_ident(c))),
        );
        select.push(format!("max({version})"));

        let insert_columns: Vec<String> = t.staged_columns().into_iter().map(quote_ident).collect();

        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} WHERE _partition_id = {} GROUP BY {}",
            quote_table(&t.staging),
            insert_columns.join(", "),
            select.join(", "),
            quote_table(&t.raw),
            quote_literal(&partition.partition_id()),
            keys.join(", ")
        )
    }

    pub fn replace_sql(&self, partition: &PartitionKey) -> String {
        format!(
            "ALTER TABLE {} REPLACE PARTITION ID {} FROM {}",
            quote_table(&self.tables.target),
            quote_literal(&partition.partition_id()),
            quote_table(&self.tables.staging)
        )
    }

    pub fn touched_sql(&self, window: &TimeWindow) -> String {
        let time = quote_ident(&self.tables.time_column);
        format!(
            "SELECT DISTINCT _partition_id AS partition_id FROM {} WHERE {time} >= {} AND {time} < {} ORDER BY partition_id FORMAT JSONEachRow",
            quote_table(&self.tables.raw),
            quote_literal(&format_datetime64(&window.from)),
            quote_literal(&format_datetime64(&window.to))
        )
    }

    async fn run(
        &self,
        step: PublishStep,
        partition: &PartitionKey,
        sql: String,
    ) -> Result<(), PublishError> {
        debug!(%step, %partition, sql = %sql, "Publish statement");
        self.sink
            .execute(&sql)
            .await
            .map(|_| ())
            .map_err(|source| PublishError::Step {
                step,
                partition: partition.partition_id(),
                source,
            })
    }
}

#[async_trait]
impl PartitionExchange for SqlExchange {
    fn tables(&self) -> &PublishTables {
        &self.tables
    }

    async fn clear_staging(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        self.run(PublishStep::ClearStaging, partition, self.clear_staging_sql(partition))
            .await
    }

    async fn stage_deduplicated(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        self.run(PublishStep::Stage, partition, self.stage_sql(partition))
            .await
    }

    async fn replace_partition(&self, partition: &PartitionKey) -> Result<(), PublishError> {
        self.run(PublishStep::Replace, partition, self.replace_sql(partition))
            .await
    }

    async fn touched_partitions(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<PartitionKey>, PublishError> {
        let rows = self
            .sink
            .execute(&self.touched_sql(window))
            .await
            .map_err(|source| PublishError::Sink {
                step: PublishStep::Discover,
                source,
            })?
            .unwrap_or_default();

        rows.iter()
            .map(|row| {
                let id = match row.get_value("partition_id") {
                    Value::String(id) => id,
                    Value::Int(n) => n.to_string(),
                    Value::Uint(n) => n.to_string(),
                    other => {
                        return Err(PublishError::UnexpectedResponse(format!(
                            "partition_id {other:?}"
                        )));
                    }
                };
                PartitionKey::from_partition_id(&id)
                    .ok_or_else(|| PublishError::UnexpectedResponse(format!("partition_id '{id}'")))
            })
            .collect()
    }
}
