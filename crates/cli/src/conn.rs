//! Connections to the journal store and the sink, built from settings.

use crate::error::CliError;
use connectors::{clickhouse::ClickHouseSink, sink::Sink};
use engine_config::Settings;
use engine_core::{
    clock::SystemClock,
    journal::Journal,
    state::{JournalStore, postgres::PgJournalStore},
};
use model::core::value::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub async fn open_journal(settings: &Settings) -> Result<Journal, CliError> {
    let store = PgJournalStore::connect(&settings.journal.dsn).await?;
    info!(process = %settings.process, "Connected to the journal store");
    Ok(Journal::new(
        Arc::new(store) as Arc<dyn JournalStore>,
        Arc::new(SystemClock),
        settings.journal_config(),
    ))
}

pub fn open_sink(settings: &Settings) -> Result<Arc<ClickHouseSink>, CliError> {
    let sink = ClickHouseSink::new(settings.clickhouse_config())?;
    debug!(url = %sink.config().url, "ClickHouse client ready");
    Ok(Arc::new(sink))
}

/// Columns replicated into the raw table: the configured source columns,
/// or else the raw table's own columns minus the ingestion-time column.
pub async fn raw_columns(settings: &Settings, sink: &dyn Sink) -> Result<Vec<String>, CliError> {
    if !settings.source.columns.is_empty() {
        return Ok(settings.source.columns.clone());
    }

    let raw = settings.sink.raw_table();
    let sql = format!(
        "SELECT name FROM system.columns \
         WHERE database = currentDatabase() AND table = '{}' \
         ORDER BY position FORMAT JSONEachRow",
        raw.replace('\'', "\\'")
    );
    let rows = sink.execute(&sql).await?.unwrap_or_default();
    let columns: Vec<String> = rows
        .iter()
        .filter_map(|row| match row.get_value("name") {
            Value::String(name) => Some(name),
            _ => None,
        })
        .filter(|name| !name.eq_ignore_ascii_case(&settings.sink.ingested_at_column))
        .collect();

    if columns.is_empty() {
        return Err(CliError::NoColumns(raw));
    }
    Ok(columns)
}
