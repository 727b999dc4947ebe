pub mod buffer;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod publish;
pub mod retry;
pub mod writer;
