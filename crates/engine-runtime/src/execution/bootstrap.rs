//! Checks that run once before the first slice.

use crate::error::RunError;
use connectors::{sink::Sink, source::Source};
use engine_processing::ingest::IngestConfig;
use tracing::info;

/// Source columns to replicate. Configured columns are used as given,
/// otherwise they are discovered. Either way the time and key columns must
/// be among them.
pub async fn resolve_columns(
    source: &dyn Source,
    config: &IngestConfig,
) -> Result<Vec<String>, RunError> {
    let columns = if config.columns.is_empty() {
        let discovered = source
            .discover_columns(&config.source_table)
            .await
            .map_err(|e| RunError::bootstrap("discover columns", e))?;
        info!(
            table = %config.source_table,
            columns = discovered.len(),
            "Discovered source columns"
        );
        discovered
    } else {
        config.columns.clone()
    };

    let has = |name: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(name));
    if !has(&config.time_column) {
        return Err(RunError::bootstrap(
            "resolve columns",
            format!("time column '{}' is not a source column", config.time_column),
        ));
    }
    if let Some(missing) = config.dedup_key.columns().iter().find(|c| !has(c)) {
        return Err(RunError::bootstrap(
            "resolve columns",
            format!("dedup key column '{missing}' is not a source column"),
        ));
    }

    // the ingestion-time column is stamped by us
    Ok(columns
        .into_iter()
        .filter(|c| !c.eq_ignore_ascii_case(&config.ingested_at_column))
        .collect())
}

/// Sink tables are provisioned outside driftline; a missing one is fatal.
pub async fn check_sink_tables(sink: &dyn Sink, tables: &[&str]) -> Result<(), RunError> {
    for table in tables {
        let exists = sink
            .table_exists(table)
            .await
            .map_err(|e| RunError::bootstrap("check sink tables", e))?;
        if !exists {
            return Err(RunError::bootstrap(
                "check sink tables",
                format!("table '{table}' does not exist"),
            ));
        }
    }
    Ok(())
}
