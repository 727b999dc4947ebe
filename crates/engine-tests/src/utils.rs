//! Shared fixtures: an orders table replicated from a memory source into a
//! memory sink, journaled in a memory store.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use connectors::{
    memory::{MemorySink, MemorySource, row},
    sink::Sink,
    source::Source,
};
use engine_core::{
    clock::ManualClock,
    journal::{Journal, JournalConfig, SanitizePolicy},
    metrics::Metrics,
    retry::RetryPolicy,
    slicer::SplitPolicy,
    state::{JournalStore, memory::MemoryJournalStore},
};
use engine_processing::{
    error::PublishStep,
    ingest::IngestConfig,
    publish::{MemoryExchange, PartitionExchange, PublishConfig, PublishTables, Publisher},
};
use engine_runtime::{Orchestrator, RuntimeConfig};
use model::{core::value::Value, dedup::DedupKeySpec, records::row::RowData};
use std::sync::Arc;

pub const PROCESS: &str = "orders";
pub const SOURCE_TABLE: &str = "shop.orders";
pub const RAW: &str = "orders_raw";
pub const STAGING: &str = "orders_staging";
pub const TARGET: &str = "orders";

/// `2025-01-01` plus `minutes`.
pub fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(minutes)
}

pub fn order(id: i64, status: &str, updated_at: DateTime<Utc>) -> RowData {
    row(
        "orders",
        &[
            ("tenant", Value::String("acme".into())),
            ("order_id", Value::Int(id)),
            ("line", Value::Int(1)),
            ("status", Value::String(status.into())),
            ("updated_at", Value::String(updated_at.to_rfc3339())),
        ],
    )
}

pub fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        step: TimeDelta::minutes(15),
        lag: TimeDelta::minutes(1),
        start_at: Some(t(0)),
        split: SplitPolicy {
            min_split: TimeDelta::seconds(60),
            max_depth: 6,
        },
        sanitize: SanitizePolicy::default(),
        retry: RetryPolicy::immediate(2),
        ingest: IngestConfig {
            source_table: SOURCE_TABLE.into(),
            time_column: "updated_at".into(),
            columns: vec![],
            raw_table: RAW.into(),
            ingested_at_column: "_ingested_at".into(),
            batch_size: 3,
            partition_tz: Tz::UTC,
            dedup_key: DedupKeySpec::new("tenant", "order_id", "line"),
        },
        publish: PublishConfig {
            enabled: true,
            gate_on_new_rows: true,
            min_new_rows: 1,
            every_slices: 0,
            backfill_missing: true,
        },
        target_table: TARGET.into(),
        staging_table: STAGING.into(),
        host: Some("test-host".into()),
    }
}

/// One replication instance. Instances made with [`Harness::peer`] share
/// the source, sink and journal data but hold locks separately.
pub struct Harness {
    pub source: Arc<MemorySource>,
    pub sink: Arc<MemorySink>,
    pub store: Arc<MemoryJournalStore>,
    pub clock: Arc<ManualClock>,
    pub journal: Arc<Journal>,
}

impl Harness {
    pub async fn new(source: MemorySource) -> Self {
        let sink = Arc::new(MemorySink::new());
        for table in [RAW, STAGING, TARGET] {
            sink.create_table(table).await;
        }
        Self::assemble(
            Arc::new(source),
            sink,
            Arc::new(MemoryJournalStore::new()),
            Arc::new(ManualClock::new(t(24 * 60))),
        )
    }

    pub async fn with_orders(rows: Vec<RowData>) -> Self {
        Self::new(MemorySource::new().with_rows(SOURCE_TABLE, rows)).await
    }

    fn assemble(
        source: Arc<MemorySource>,
        sink: Arc<MemorySink>,
        store: Arc<MemoryJournalStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let journal = Arc::new(Journal::new(
            Arc::clone(&store) as Arc<dyn JournalStore>,
            clock.clone(),
            JournalConfig::new(PROCESS),
        ));
        Self {
            source,
            sink,
            store,
            clock,
            journal,
        }
    }

    pub fn peer(&self) -> Self {
        Self::assemble(
            Arc::clone(&self.source),
            Arc::clone(&self.sink),
            Arc::new(self.store.connect_peer()),
            Arc::clone(&self.clock),
        )
    }

    pub fn orchestrator(&self, config: RuntimeConfig) -> Orchestrator {
        let sink = Arc::clone(&self.sink);
        Orchestrator::new(
            Arc::clone(&self.source) as Arc<dyn Source>,
            Arc::clone(&self.sink) as Arc<dyn Sink>,
            Arc::clone(&self.journal),
            self.clock.clone(),
            config,
        )
        .with_exchange(move |tables| {
            Arc::new(MemoryExchange::new(Arc::clone(&sink), tables)) as Arc<dyn PartitionExchange>
        })
    }

    /// Like [`Harness::orchestrator`], with every publish failing at `step`.
    pub fn orchestrator_failing_publish(&self, config: RuntimeConfig, step: PublishStep) -> Orchestrator {
        let sink = Arc::clone(&self.sink);
        self.orchestrator(config).with_exchange(move |tables| {
            Arc::new(MemoryExchange::new(Arc::clone(&sink), tables).with_failure(step, None))
                as Arc<dyn PartitionExchange>
        })
    }

    /// A standalone publisher over the harness tables.
    pub fn publisher(&self, config: RuntimeConfig) -> Publisher {
        let ingest = config.ingest;
        let tables = PublishTables {
            raw: ingest.raw_table,
            staging: config.staging_table,
            target: config.target_table,
            time_column: ingest.time_column,
            ingested_at_column: ingest.ingested_at_column,
            key: ingest.dedup_key,
            columns: ["tenant", "order_id", "line", "status", "updated_at"]
                .map(String::from)
                .to_vec(),
            tz: ingest.partition_tz,
        };
        Publisher::new(
            Arc::new(MemoryExchange::new(Arc::clone(&self.sink), tables)),
            Metrics::new(),
        )
    }

    /// `(order_id, status)` of every published row, sorted.
    pub async fn published(&self) -> Vec<(i64, String)> {
        let mut rows: Vec<(i64, String)> = self
            .sink
            .rows(TARGET)
            .await
            .iter()
            .map(|r| {
                (
                    r.get_value("order_id").as_i64().unwrap_or_default(),
                    r.get_value("status").as_string().unwrap_or_default(),
                )
            })
            .collect();
        rows.sort();
        rows
    }
}
