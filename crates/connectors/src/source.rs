use crate::error::SourceError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use model::{records::batch::RowBatch, window::TimeWindow};

/// Lets generic code ask "was this refused because the request was too
/// large?" without knowing the concrete error type.
pub trait OverloadSignal {
    fn is_overload(&self) -> bool;
}

impl OverloadSignal for SourceError {
    fn is_overload(&self) -> bool {
        matches!(self, SourceError::Overloaded { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub table: String,
    pub time_column: String,
    pub columns: Vec<String>,
    pub window: TimeWindow,
}

impl FetchRequest {
    pub fn new(table: &str, time_column: &str, columns: Vec<String>, window: TimeWindow) -> Self {
        Self {
            table: table.to_string(),
            time_column: time_column.to_string(),
            columns,
            window,
        }
    }

    pub fn with_window(&self, window: TimeWindow) -> Self {
        Self {
            window,
            ..self.clone()
        }
    }
}

pub type RowBatchStream = BoxStream<'static, Result<RowBatch, SourceError>>;

/// Read side of the pipeline: a wide-column store queried by time range.
#[async_trait]
pub trait Source: Send + Sync {
    async fn discover_columns(&self, table: &str) -> Result<Vec<String>, SourceError>;

    /// Rows with `window.from <= time_column < window.to`, ordered by the
    /// time column. An overload may be reported either up front or from the
    /// stream.
    async fn fetch_increment(&self, request: &FetchRequest) -> Result<RowBatchStream, SourceError>;
}
