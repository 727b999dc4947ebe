use chrono::{DateTime, Utc};
use connectors::error::ConnectorError;
use model::window::{TimeWindow, WindowError};
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Errors from a [`JournalStore`](crate::state::JournalStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// An active record already exists for the process.
    #[error("Unique violation: {0}")]
    UniqueViolation(String),

    /// `run_journal` exists but is not partitioned by time.
    #[error("Journal table '{0}' exists but is not partitioned by time")]
    NotBucketed(String),

    #[error("Journal store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(tokio_postgres::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectorError),

    #[error("Failed to decode journal row: {0}")]
    Decode(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            return StoreError::UniqueViolation(err.to_string());
        }
        StoreError::Database(err)
    }
}

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal store error: {0}")]
    Store(StoreError),

    #[error("Journal is not time-bucketed: {0}")]
    NotBucketed(String),

    #[error("Active record for '{process}' vanished while resolving a race on {window}")]
    LostRace { process: String, window: TimeWindow },

    #[error(transparent)]
    InvalidWindow(#[from] WindowError),
}

impl From<StoreError> for JournalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotBucketed(table) => JournalError::NotBucketed(table),
            other => JournalError::Store(other),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SlicerError {
    #[error("Empty range: since {since} is not before until {until}")]
    EmptyRange {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}
