use connectors::{
    error::{SinkError, SourceError},
    source::OverloadSignal,
};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to write batch to '{table}' after {attempts} attempt(s): {source}")]
    Write {
        table: String,
        attempts: usize,
        #[source]
        source: SinkError,
    },
}

impl OverloadSignal for IngestError {
    fn is_overload(&self) -> bool {
        match self {
            IngestError::Source(err) => err.is_overload(),
            IngestError::Write { .. } => false,
        }
    }
}

/// The parts of publishing one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    ClearStaging,
    Stage,
    Replace,
    Discover,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishStep::ClearStaging => "clear staging",
            PublishStep::Stage => "stage",
            PublishStep::Replace => "replace",
            PublishStep::Discover => "discover partitions",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Failed to {step} partition {partition}: {source}")]
    Step {
        step: PublishStep,
        partition: String,
        #[source]
        source: SinkError,
    },

    #[error("Failed to {step}: {source}")]
    Sink {
        step: PublishStep,
        #[source]
        source: SinkError,
    },

    #[error("Unexpected sink response: {0}")]
    UnexpectedResponse(String),
}
