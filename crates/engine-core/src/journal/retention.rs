use super::Journal;
use crate::error::JournalError;
use chrono::{DateTime, TimeDelta, Utc};
use model::{
    core::time::{format_canonical, parse_instant},
    journal::{Extensions, StatePatch},
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Lock and state row shared by every process pruning the same store. Kept
/// outside the `journal:<process>` lock namespace.
pub const RETENTION_PROCESS: &str = "__retention__";
const LAST_PRUNE_AT: &str = "last_prune_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    /// Minimum time between two non-forced prunes.
    pub prune_interval: TimeDelta,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            prune_interval: TimeDelta::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub cutoff: DateTime<Utc>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PruneOutcome {
    Pruned(PruneReport),
    NotDue { last_prune_at: DateTime<Utc> },
    Locked,
}

impl Journal {
    /// Drops ledger buckets that lie entirely before the retention horizon.
    /// Unless `force` is set, does nothing when the last prune is more
    /// recent than the prune interval.
    pub async fn prune_retention(&self, force: bool) -> Result<PruneOutcome, JournalError> {
        if !self.store().try_advisory_lock(RETENTION_PROCESS).await? {
            return Ok(PruneOutcome::Locked);
        }

        let outcome = self.prune_locked(force).await;
        if let Err(error) = self.store().advisory_unlock(RETENTION_PROCESS).await {
            warn!(%error, "Failed to release retention lock");
        }
        outcome
    }

    /// Throttled, best-effort prune for the start of a run.
    pub async fn maybe_prune(&self) -> Option<PruneReport> {
        match self.prune_retention(false).await {
            Ok(PruneOutcome::Pruned(report)) => Some(report),
            Ok(_) => None,
            Err(error) => {
                warn!(%error, "Journal retention failed");
                None
            }
        }
    }

    async fn prune_locked(&self, force: bool) -> Result<PruneOutcome, JournalError> {
        let now = self.now();
        let policy = self.config().retention;

        if !force
            && let Some(last) = self.last_prune_at().await?
            && now - last < policy.prune_interval
        {
            return Ok(PruneOutcome::NotDue {
                last_prune_at: last,
            });
        }

        let cutoff = now - TimeDelta::days(i64::from(policy.retention_days));
        let mut dropped = Vec::new();
        for bucket in self.store().list_buckets().await? {
            if bucket.upper_bound() <= cutoff {
                self.store().drop_bucket(&bucket).await?;
                dropped.push(bucket.name);
            }
        }

        let mut extra = Extensions::new();
        extra.insert(LAST_PRUNE_AT.into(), json!(format_canonical(&now)));
        extra.insert("last_prune_dropped".into(), json!(dropped.len()));
        self.store()
            .upsert_state(RETENTION_PROCESS, &StatePatch::at(now).extra(extra))
            .await?;

        info!(cutoff = %format_canonical(&cutoff), dropped = dropped.len(), "Pruned journal buckets");
        Ok(PruneOutcome::Pruned(PruneReport { cutoff, dropped }))
    }

    async fn last_prune_at(&self) -> Result<Option<DateTime<Utc>>, JournalError> {
        let state = self.store().load_state(RETENTION_PROCESS).await?;
        Ok(state
            .as_ref()
            .and_then(|s| s.extra.get(LAST_PRUNE_AT))
            .and_then(|v| v.as_str())
            .and_then(|s| parse_instant(s).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        journal::JournalConfig,
        state::{JournalStore, memory::MemoryJournalStore},
    };
    use chrono::TimeZone;
    use model::window::TimeWindow;
    use std::sync::Arc;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 12, 0, 0).unwrap()
    }

    async fn close_one(journal: &Journal, at: DateTime<Utc>) {
        let window = TimeWindow::new(at - TimeDelta::minutes(15), at).unwrap();
        journal.mark_running(&window, None, None).await.unwrap();
        journal
            .mark_done(&window, 0, 0, Extensions::new())
            .await
            .unwrap();
    }

    fn setup() -> (MemoryJournalStore, ManualClock, Journal) {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(day(1));
        let config = JournalConfig::new("orders").with_retention(RetentionPolicy {
            retention_days: 7,
            prune_interval: TimeDelta::hours(24),
        });
        let journal = Journal::new(Arc::new(store.connect_peer()), Arc::new(clock.clone()), config);
        (store, clock, journal)
    }

    #[tokio::test]
    async fn drops_only_buckets_past_the_horizon() {
        let (store, clock, journal) = setup();
        close_one(&journal, day(1)).await;
        clock.set(day(20));
        close_one(&journal, day(20)).await;

        let outcome = journal.prune_retention(false).await.unwrap();
        let PruneOutcome::Pruned(report) = outcome else {
            panic!("expected a prune, got {outcome:?}");
        };
        assert_eq!(report.dropped, vec!["run_journal_p20250101".to_string()]);

        let left = store.records().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ts_start.date_naive(), day(20).date_naive());
    }

    #[tokio::test]
    async fn prune_is_throttled_unless_forced() {
        let (_store, clock, journal) = setup();
        assert!(matches!(
            journal.prune_retention(false).await.unwrap(),
            PruneOutcome::Pruned(_)
        ));
        clock.advance(TimeDelta::hours(1));
        assert!(matches!(
            journal.prune_retention(false).await.unwrap(),
            PruneOutcome::NotDue { .. }
        ));
        assert!(journal.maybe_prune().await.is_none());
        assert!(matches!(
            journal.prune_retention(true).await.unwrap(),
            PruneOutcome::Pruned(_)
        ));
        clock.advance(TimeDelta::hours(25));
        assert!(journal.maybe_prune().await.is_some());
    }

    #[tokio::test]
    async fn concurrent_pruner_is_locked_out() {
        let (store, _clock, journal) = setup();
        let other = store.connect_peer();
        assert!(other.try_advisory_lock(RETENTION_PROCESS).await.unwrap());
        assert_eq!(
            journal.prune_retention(true).await.unwrap(),
            PruneOutcome::Locked
        );
        other.advisory_unlock(RETENTION_PROCESS).await.unwrap();
        assert!(matches!(
            journal.prune_retention(true).await.unwrap(),
            PruneOutcome::Pruned(_)
        ));
    }

    #[tokio::test]
    async fn a_process_named_retention_does_not_block_pruning() {
        let (store, clock, journal) = setup();
        let retention = Journal::new(
            Arc::new(store.connect_peer()),
            Arc::new(clock.clone()),
            JournalConfig::new("retention"),
        );
        assert!(retention.try_acquire_exclusive_lock().await.unwrap());
        close_one(&retention, day(1)).await;

        assert!(matches!(
            journal.prune_retention(true).await.unwrap(),
            PruneOutcome::Pruned(_)
        ));
        let state = retention.state().await.unwrap().unwrap();
        assert!(!state.extra.contains_key("last_prune_at"));
    }
}
