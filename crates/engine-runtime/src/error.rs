use engine_config::SettingsError;
use engine_core::error::{JournalError, SlicerError};
use thiserror::Error;

/// Errors that end a run early. A failing slice is not one of them: it is
/// recorded in the journal and reported in the `RunReport`.
#[derive(Debug, Error)]
pub enum RunError {
    /// Setup could not complete; nothing was ingested.
    #[error("Bootstrap failed at {step}: {reason}")]
    Bootstrap { step: &'static str, reason: String },

    /// A critical journal transition failed.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Slicer error: {0}")]
    Slicer(#[from] SlicerError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// No watermark, no configured start and no explicit lower bound.
    #[error("No starting point for process '{0}': set source.start_at or pass a lower bound")]
    NoStartingPoint(String),
}

impl RunError {
    pub(crate) fn bootstrap(step: &'static str, reason: impl ToString) -> Self {
        RunError::Bootstrap {
            step,
            reason: reason.to_string(),
        }
    }
}
