use crate::{error::IngestError, retry::classify_sink_error};
use connectors::sink::Sink;
use engine_core::{
    metrics::Metrics,
    retry::{RetryError, RetryPolicy},
};
use model::records::row::RowData;
use std::{sync::Arc, time::Instant};
use tracing::{info, warn};

/// Inserts row batches into one sink table, retrying transient failures and
/// reconnecting before every retry.
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
    table: String,
    columns: Vec<String>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl SinkWriter {
    pub fn new(
        sink: Arc<dyn Sink>,
        table: &str,
        columns: Vec<String>,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            sink,
            table: table.to_string(),
            columns,
            retry,
            metrics,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub async fn write(&self, rows: &[RowData]) -> Result<u64, IngestError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let mut attempts = 0usize;
        let result = self
            .retry
            .run(
                |attempt| {
                    attempts = attempt + 1;
                    let sink = Arc::clone(&self.sink);
                    let (table, columns) = (self.table.as_str(), self.columns.as_slice());
                    async move {
                        if attempt > 0 {
                            warn!(table, attempt, "Retrying sink insert");
                            if let Err(error) = sink.reconnect().await {
                                warn!(table, %error, "Sink reconnect failed");
                            }
                        }
                        sink.insert_rows(table, rows, columns).await
                    }
                },
                classify_sink_error,
            )
            .await;

        self.metrics
            .add_sink_retries(attempts.saturating_sub(1) as u64);

        match result {
            Ok(written) => {
                info!(
                    table = %self.table,
                    rows = written,
                    attempts,
                    duration_ms = start.elapsed().as_millis(),
                    "Batch written"
                );
                Ok(written)
            }
            Err(err) => {
                let attempts = match &err {
                    RetryError::AttemptsExceeded { attempts, .. } => *attempts,
                    RetryError::Fatal(_) => attempts,
                };
                Err(IngestError::Write {
                    table: self.table.clone(),
                    attempts,
                    source: err.into_inner(),
                })
            }
        }
    }
}
