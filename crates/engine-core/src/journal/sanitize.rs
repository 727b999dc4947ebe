use super::Journal;
use crate::{
    error::JournalError,
    state::{RecordFilter, Transition},
};
use chrono::TimeDelta;
use model::{
    journal::{CloseReason, DetailsPatch, RunStatus},
    window::TimeWindow,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Age limits after which active records are considered abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizePolicy {
    /// Planned records that never reported progress.
    pub planned_ttl: TimeDelta,
    /// Running records whose last heartbeat is older than this.
    pub heartbeat_timeout: TimeDelta,
    /// Running records started longer ago than this, heartbeat or not.
    pub hard_ttl: TimeDelta,
}

impl Default for SanitizePolicy {
    fn default() -> Self {
        Self {
            planned_ttl: TimeDelta::minutes(10),
            heartbeat_timeout: TimeDelta::minutes(10),
            hard_ttl: TimeDelta::hours(6),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeReport {
    pub hard_ttl: Vec<i64>,
    pub heartbeat_timeout: Vec<i64>,
    pub planned_ttl: Vec<i64>,
}

impl SanitizeReport {
    pub fn total(&self) -> usize {
        self.hard_ttl.len() + self.heartbeat_timeout.len() + self.planned_ttl.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub skipped: Vec<i64>,
    pub errored: Vec<i64>,
}

impl Journal {
    /// Closes abandoned active records of this process. Best effort: a
    /// failing step is logged and the remaining steps still run.
    pub async fn sanitize_stale(&self, policy: &SanitizePolicy) -> SanitizeReport {
        let now = self.now();
        let running = || RecordFilter::for_process(self.process().as_str()).statuses(&[RunStatus::Running]);
        let close = |status, reason| {
            Transition::to(status)
                .closing(now)
                .patch(DetailsPatch::reason(reason))
        };

        // hard ttl first so a record past both limits reports the stricter one
        let hard_ttl = self
            .sanitize_step(
                running().started_before(now - policy.hard_ttl),
                close(RunStatus::Error, CloseReason::HardTtl),
            )
            .await;
        let heartbeat_timeout = self
            .sanitize_step(
                running().last_seen_before(now - policy.heartbeat_timeout),
                close(RunStatus::Error, CloseReason::HeartbeatTimeout),
            )
            .await;
        let planned_ttl = self
            .sanitize_step(
                RecordFilter::for_process(self.process().as_str())
                    .statuses(&[RunStatus::Planned])
                    .started_before(now - policy.planned_ttl)
                    .without_heartbeat(),
                close(RunStatus::Skipped, CloseReason::PlannedTtl),
            )
            .await;

        let report = SanitizeReport {
            hard_ttl,
            heartbeat_timeout,
            planned_ttl,
        };
        if report.total() > 0 {
            warn!(
                process = %self.process(),
                hard_ttl = ?report.hard_ttl,
                heartbeat_timeout = ?report.heartbeat_timeout,
                planned_ttl = ?report.planned_ttl,
                "Closed stale journal records"
            );
        }
        report
    }

    async fn sanitize_step(&self, filter: RecordFilter, transition: Transition) -> Vec<i64> {
        match self.store().transition_all(&filter, &transition).await {
            Ok(ids) => ids,
            Err(error) => {
                warn!(process = %self.process(), %error, "Sanitize step failed");
                Vec::new()
            }
        }
    }

    /// Demotes every active record for `window` except `keep`: planned ones
    /// become `skipped`, running ones `error`.
    pub async fn resolve_active_conflicts(
        &self,
        window: &TimeWindow,
        keep: Option<i64>,
    ) -> Result<ConflictReport, JournalError> {
        let now = self.now();
        let base = RecordFilter::for_process(self.process().as_str()).window(*window);
        let base = match keep {
            Some(id) => base.excluding(id),
            None => base,
        };
        let demote = |status| {
            Transition::to(status)
                .closing(now)
                .patch(DetailsPatch::reason(CloseReason::Conflict))
        };

        let skipped = self
            .store()
            .transition_all(
                &base.clone().statuses(&[RunStatus::Planned]),
                &demote(RunStatus::Skipped),
            )
            .await?;
        let errored = self
            .store()
            .transition_all(
                &base.statuses(&[RunStatus::Running]),
                &demote(RunStatus::Error),
            )
            .await?;

        if !skipped.is_empty() || !errored.is_empty() {
            info!(process = %self.process(), window = %window, ?skipped, ?errored, "Resolved conflicting records");
        }
        Ok(ConflictReport { skipped, errored })
    }
}
