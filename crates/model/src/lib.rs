pub mod core;
pub mod dedup;
pub mod journal;
pub mod partition;
pub mod records;
pub mod window;
