use chrono::{DateTime, Utc};
use engine_core::{
    journal::{PruneReport, SanitizeReport},
    metrics::MetricsSnapshot,
};
use model::{partition::PartitionKey, window::TimeWindow};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run went through its windows, possibly stopping at a failed one.
    Completed,
    /// The watermark had already caught up with the run bounds.
    NothingToDo,
    /// Another instance holds the process lock; the journal was not touched.
    LockNotAcquired,
}

/// The window that stopped a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceFailure {
    pub window: TimeWindow,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub process: String,
    pub outcome: RunOutcome,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub slices_planned: usize,
    pub slices_done: usize,
    pub failure: Option<SliceFailure>,
    /// Watermark when the run ended.
    pub watermark: Option<DateTime<Utc>>,
    pub sanitized: SanitizeReport,
    pub pruned: Option<PruneReport>,
    pub published: Vec<PartitionKey>,
    pub publish_failures: Vec<(PartitionKey, String)>,
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    pub(crate) fn new(process: &str, outcome: RunOutcome) -> Self {
        Self {
            process: process.to_string(),
            outcome,
            since: None,
            until: None,
            slices_planned: 0,
            slices_done: 0,
            failure: None,
            watermark: None,
            sanitized: SanitizeReport::default(),
            pruned: None,
            published: Vec::new(),
            publish_failures: Vec::new(),
            metrics: MetricsSnapshot::default(),
        }
    }

    /// `true` unless a slice failed.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}
