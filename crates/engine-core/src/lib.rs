pub mod clock;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod retry;
pub mod slicer;
pub mod state;
