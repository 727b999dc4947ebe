use crate::error::SinkError;
use async_trait::async_trait;
use model::records::row::RowData;

/// Write side of the pipeline: a columnar analytical store.
///
/// Implementations make a single attempt per call; retrying and
/// reconnecting is up to the caller.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Inserts `rows` projected onto `columns` and returns the number of rows
    /// written.
    async fn insert_rows(
        &self,
        table: &str,
        rows: &[RowData],
        columns: &[String],
    ) -> Result<u64, SinkError>;

    /// Runs a statement. Returns the result rows for statements that produce
    /// any, `None` otherwise.
    async fn execute(&self, sql: &str) -> Result<Option<Vec<RowData>>, SinkError>;

    async fn table_exists(&self, table: &str) -> Result<bool, SinkError>;

    /// Drops and re-establishes the underlying connection.
    async fn reconnect(&self) -> Result<(), SinkError>;
}
