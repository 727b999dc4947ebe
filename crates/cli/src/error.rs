use connectors::error::{ConnectorError, SinkError};
use engine_config::SettingsError;
use engine_core::error::{JournalError, StoreError};
use model::window::WindowError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to load settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Failed to connect to the journal store: {0}")]
    Store(#[from] StoreError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Failed to set up the sink client: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Invalid window: {0}")]
    Window(#[from] WindowError),

    #[error("Failed to serialize data to JSON: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// Another instance holds the process lock.
    #[error("Process '{0}' is locked by another instance")]
    Locked(String),

    #[error("Raw table '{0}' has no replicated columns")]
    NoColumns(String),

    #[error("{failed} partition(s) failed to publish")]
    PublishFailed { failed: usize },
}
