pub mod error;
pub mod execution;

pub use error::RunError;
pub use execution::{
    orchestrator::{Orchestrator, RunBounds, RuntimeConfig},
    report::{RunOutcome, RunReport, SliceFailure},
};
