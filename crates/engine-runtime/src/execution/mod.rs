pub mod bootstrap;
pub mod orchestrator;
pub mod report;
