//! In-process stand-ins for the source and sink, used by tests and local
//! dry runs.

use crate::{
    error::{SinkError, SourceError},
    sink::Sink,
    source::{FetchRequest, RowBatchStream, Source},
};
use async_trait::async_trait;
use chrono::TimeDelta;
use futures::StreamExt;
use model::{
    core::{
        time::normalize,
        value::{FieldValue, Value},
    },
    records::{batch::RowBatch, row::RowData},
    window::TimeWindow,
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::Mutex;

/// Serves rows from memory. Windows longer than `overload_above` are refused
/// with [`SourceError::Overloaded`].
pub struct MemorySource {
    tables: Mutex<HashMap<String, Vec<RowData>>>,
    overload_above: Option<TimeDelta>,
    batch_size: usize,
    fetches: Mutex<Vec<TimeWindow>>,
    fail_next: Mutex<Option<SourceError>>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            overload_above: None,
            batch_size: 100,
            fetches: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<RowData>) -> Self {
        self.tables
            .get_mut()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        self
    }

    pub fn with_overload_above(mut self, limit: TimeDelta) -> Self {
        self.overload_above = Some(limit);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn insert(&self, table: &str, rows: Vec<RowData>) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// The next fetch fails with `err` before producing any rows.
    pub async fn fail_next_fetch(&self, err: SourceError) {
        *self.fail_next.lock().await = Some(err);
    }

    /// Every window a fetch was attempted for, refused ones included.
    pub async fn fetched_windows(&self) -> Vec<TimeWindow> {
        self.fetches.lock().await.clone()
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn discover_columns(&self, table: &str) -> Result<Vec<String>, SourceError> {
        let tables = self.tables.lock().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| SourceError::TableNotFound(table.to_string()))?;
        let mut columns: Vec<String> = Vec::new();
        for row in rows {
            for name in row.column_names() {
                if !columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                    columns.push(name.to_string());
                }
            }
        }
        Ok(columns)
    }

    async fn fetch_increment(&self, request: &FetchRequest) -> Result<RowBatchStream, SourceError> {
        self.fetches.lock().await.push(request.window);

        if let Some(err) = self.fail_next.lock().await.take() {
            return Err(err);
        }

        if let Some(limit) = self.overload_above
            && request.window.duration() > limit
        {
            return Err(SourceError::Overloaded {
                table: request.table.clone(),
                window: request.window,
                message: format!(
                    "window of {}s exceeds {}s",
                    request.window.duration().num_seconds(),
                    limit.num_seconds()
                ),
            });
        }

        let tables = self.tables.lock().await;
        let rows = tables
            .get(&request.table)
            .ok_or_else(|| SourceError::TableNotFound(request.table.clone()))?;

        let mut selected: Vec<_> = rows
            .iter()
            .filter_map(|row| {
                let ts = normalize(&row.get_value(&request.time_column)).ok()?;
                request.window.contains(&ts).then(|| (ts, project(row, &request.columns)))
            })
            .collect();
        selected.sort_by_key(|(ts, _)| *ts);

        let batches: Vec<Result<RowBatch, SourceError>> = selected
            .into_iter()
            .map(|(_, row)| row)
            .collect::<Vec<_>>()
            .chunks(self.batch_size)
            .map(|chunk| Ok(RowBatch::new(chunk.to_vec())))
            .collect();

        Ok(futures::stream::iter(batches).boxed())
    }
}

fn project(row: &RowData, columns: &[String]) -> RowData {
    if columns.is_empty() {
        return row.clone();
    }
    let fields = columns
        .iter()
        .map(|c| FieldValue {
            name: c.clone(),
            value: Some(row.get_value(c)),
        })
        .collect();
    RowData::new(&row.entity, fields)
}

/// Keeps tables as row vectors and records every statement it is asked to
/// run.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, Vec<RowData>>>,
    statements: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, Vec<RowData>)>>,
    failing_statements: Mutex<Vec<String>>,
    fail_next_inserts: AtomicUsize,
    inserts: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, table: &str) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default();
    }

    pub async fn rows(&self, table: &str) -> Vec<RowData> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrites the contents of `table`.
    pub async fn set_rows(&self, table: &str, rows: Vec<RowData>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }

    pub async fn statements(&self) -> Vec<String> {
        self.statements.lock().await.clone()
    }

    /// Statements starting with `prefix` return `rows`.
    pub async fn respond_to(&self, prefix: &str, rows: Vec<RowData>) {
        self.responses.lock().await.push((prefix.to_string(), rows));
    }

    /// Statements containing `fragment` fail with a server error.
    pub async fn fail_statements_containing(&self, fragment: &str) {
        self.failing_statements
            .lock()
            .await
            .push(fragment.to_string());
    }

    pub async fn clear_statement_failures(&self) {
        self.failing_statements.lock().await.clear();
    }

    /// The next `n` inserts fail with a transport error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.fail_next_inserts.store(n, Ordering::SeqCst);
    }

    /// Insert attempts, failed ones included.
    pub fn insert_attempts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn insert_rows(
        &self,
        table: &str,
        rows: &[RowData],
        columns: &[String],
    ) -> Result<u64, SinkError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::Transport("connection reset by peer".to_string()));
        }

        let mut tables = self.tables.lock().await;
        let target = tables.entry(table.to_string()).or_default();
        target.extend(rows.iter().map(|row| project(row, columns)));
        Ok(rows.len() as u64)
    }

    async fn execute(&self, sql: &str) -> Result<Option<Vec<RowData>>, SinkError> {
        self.statements.lock().await.push(sql.to_string());

        if self
            .failing_statements
            .lock()
            .await
            .iter()
            .any(|f| sql.contains(f.as_str()))
        {
            return Err(SinkError::Server {
                code: Some(0),
                status: 500,
                message: format!("injected failure for: {sql}"),
            });
        }

        let responses = self.responses.lock().await;
        Ok(responses
            .iter()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, rows)| rows.clone()))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, SinkError> {
        Ok(self.tables.lock().await.contains_key(table))
    }

    async fn reconnect(&self) -> Result<(), SinkError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Convenience for building test rows.
pub fn row(entity: &str, fields: &[(&str, Value)]) -> RowData {
    fields
        .iter()
        .fold(RowData::new(entity, vec![]), |row, (name, value)| {
            row.with(name, value.clone())
        })
}
