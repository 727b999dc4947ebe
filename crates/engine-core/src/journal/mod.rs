//! Durable run ledger and aggregated process state.
//!
//! Every window the orchestrator processes moves through
//! `planned -> running -> ok | error` here, and the watermark only moves when
//! a window closes `ok`. The store guarantees a single active record per
//! process; this module turns the races around that guarantee into
//! "reuse the existing record", or, for the lock holder, "demote the stale
//! record and take the slot".

use crate::{
    clock::Clock,
    error::{JournalError, StoreError},
    state::{JournalStore, NewRecord, RecordFilter, Transition},
};
use chrono::{DateTime, TimeDelta, Utc};
use model::{
    core::{identifiers::ProcessName, time::truncate_millis},
    journal::{DetailsPatch, Extensions, JournalRecord, ProcessState, RunStatus, StatePatch},
    window::TimeWindow,
};
use serde_json::json;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, Ordering},
};
use tracing::{debug, info, warn};

pub mod lock;
pub mod retention;
pub mod sanitize;

pub use retention::{PruneOutcome, PruneReport, RETENTION_PROCESS, RetentionPolicy};
pub use sanitize::{ConflictReport, SanitizePolicy, SanitizeReport};

/// Insert attempts before a race on the active slot is given up.
const RACE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub process_name: ProcessName,
    /// Heartbeats closer together than this are dropped.
    pub heartbeat_interval: TimeDelta,
    pub retention: RetentionPolicy,
}

impl JournalConfig {
    pub fn new(process_name: impl Into<ProcessName>) -> Self {
        Self {
            process_name: process_name.into(),
            heartbeat_interval: TimeDelta::seconds(30),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: TimeDelta) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

pub struct Journal {
    store: Arc<dyn JournalStore>,
    clock: Arc<dyn Clock>,
    config: JournalConfig,
    last_heartbeat_ms: AtomicI64,
    /// Set while this session holds the process lock. Shared with derived
    /// journals, which run under their parent's lock.
    lock_held: Arc<AtomicBool>,
}

impl Journal {
    pub fn new(store: Arc<dyn JournalStore>, clock: Arc<dyn Clock>, config: JournalConfig) -> Self {
        Self {
            store,
            clock,
            config,
            last_heartbeat_ms: AtomicI64::new(i64::MIN),
            lock_held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same store and clock, scoped under `<process>:<suffix>`.
    pub fn derive(&self, suffix: &str) -> Journal {
        let mut config = self.config.clone();
        config.process_name = self.config.process_name.derive(suffix);
        let mut derived = Journal::new(Arc::clone(&self.store), Arc::clone(&self.clock), config);
        derived.lock_held = Arc::clone(&self.lock_held);
        derived
    }

    pub fn process(&self) -> &ProcessName {
        &self.config.process_name
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn JournalStore {
        self.store.as_ref()
    }

    pub(crate) fn set_lock_held(&self, held: bool) {
        self.lock_held.store(held, Ordering::SeqCst);
    }

    pub fn holds_lock(&self) -> bool {
        self.lock_held.load(Ordering::SeqCst)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        truncate_millis(self.clock.now())
    }

    fn name(&self) -> &str {
        self.config.process_name.as_str()
    }

    /// Provisions the ledger and state tables. Fails with
    /// [`JournalError::NotBucketed`] on a ledger that is not time-partitioned.
    pub async fn ensure(&self) -> Result<(), JournalError> {
        self.store.ensure_schema().await?;
        Ok(())
    }

    pub async fn get_watermark(&self) -> Result<Option<DateTime<Utc>>, JournalError> {
        Ok(self
            .store
            .load_state(self.name())
            .await?
            .and_then(|s| s.last_ok_end)
            .map(truncate_millis))
    }

    pub async fn state(&self) -> Result<Option<ProcessState>, JournalError> {
        Ok(self.store.load_state(self.name()).await?)
    }

    /// Latest records of this process, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<JournalRecord>, JournalError> {
        Ok(self
            .store
            .query(&RecordFilter::for_process(self.name()), limit)
            .await?)
    }

    /// Returns the id of the active record for `window`, creating a `planned`
    /// one when there is none. When another window holds the active slot,
    /// the lock holder demotes it; any other caller gets its id back.
    pub async fn mark_planned(&self, window: &TimeWindow) -> Result<i64, JournalError> {
        let for_window = RecordFilter::active(self.name()).window(*window);

        for _ in 0..RACE_ATTEMPTS {
            if let Some(existing) = self.store.find_latest(&for_window).await? {
                debug!(process = %self.process(), window = %window, id = existing.id, "Reusing active record");
                return Ok(existing.id);
            }

            match self
                .store
                .insert_active(&self.new_record(window, RunStatus::Planned, None, None))
                .await
            {
                Ok(id) => {
                    debug!(process = %self.process(), window = %window, id, "Planned window");
                    return Ok(id);
                }
                Err(StoreError::UniqueViolation(_)) => {
                    if let Some(id) = self.settle_race(window).await? {
                        return Ok(id);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(JournalError::LostRace {
            process: self.name().to_string(),
            window: *window,
        })
    }

    /// Moves the record for `window` to `running`, reusing a planned or
    /// already running one, or inserting a fresh running record.
    pub async fn mark_running(
        &self,
        window: &TimeWindow,
        host: Option<&str>,
        pid: Option<i32>,
    ) -> Result<i64, JournalError> {
        let now = self.now();
        let start = Transition::to(RunStatus::Running)
            .patch(DetailsPatch::heartbeat(now))
            .owner(host.map(str::to_string), pid);
        let planned = RecordFilter::for_process(self.name())
            .statuses(&[RunStatus::Planned])
            .window(*window);
        let running = RecordFilter::for_process(self.name())
            .statuses(&[RunStatus::Running])
            .window(*window);

        let mut claimed = None;
        for _ in 0..RACE_ATTEMPTS {
            if let Some(id) = self.store.claim_latest(&planned, &start).await? {
                claimed = Some(id);
                break;
            }
            if let Some(id) = self.store.claim_latest(&running, &start).await? {
                debug!(process = %self.process(), window = %window, id, "Re-entering running record");
                claimed = Some(id);
                break;
            }

            self.resolve_active_conflicts(window, None).await?;
            let record = self.new_record(window, RunStatus::Running, host, pid);
            let record = NewRecord {
                heartbeat_ts: Some(now),
                ..record
            };
            match self.store.insert_active(&record).await {
                Ok(id) => {
                    claimed = Some(id);
                    break;
                }
                Err(StoreError::UniqueViolation(_)) => {
                    if let Some(id) = self.settle_race(window).await? {
                        claimed = Some(id);
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let id = claimed.ok_or_else(|| JournalError::LostRace {
            process: self.name().to_string(),
            window: *window,
        })?;

        self.store
            .upsert_state(
                self.name(),
                &StatePatch::at(now)
                    .status(RunStatus::Running)
                    .started(now),
            )
            .await?;
        info!(process = %self.process(), window = %window, id, "Window running");
        Ok(id)
    }

    /// Records liveness and progress on the process state. Throttled to one
    /// write per heartbeat interval; never touches the ledger and never
    /// fails. Returns whether a write happened.
    pub async fn heartbeat(&self, progress: Option<serde_json::Value>) -> bool {
        let now = self.now();
        let now_ms = now.timestamp_millis();
        let interval_ms = self.config.heartbeat_interval.num_milliseconds();
        let last = self.last_heartbeat_ms.load(Ordering::SeqCst);

        if last != i64::MIN && now_ms.saturating_sub(last) < interval_ms {
            return false;
        }
        if self
            .last_heartbeat_ms
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        match self
            .store
            .upsert_state(self.name(), &StatePatch::at(now).heartbeat(now, progress))
            .await
        {
            Ok(()) => true,
            Err(error) => {
                warn!(process = %self.process(), %error, "Heartbeat failed");
                false
            }
        }
    }

    /// Merges `extra` into the process state. Best effort, like
    /// [`Journal::heartbeat`]: failures are logged and reported as `false`.
    pub async fn annotate(&self, extra: Extensions) -> bool {
        match self
            .store
            .upsert_state(self.name(), &StatePatch::at(self.now()).extra(extra))
            .await
        {
            Ok(()) => true,
            Err(error) => {
                warn!(process = %self.process(), %error, "Could not annotate process state");
                false
            }
        }
    }

    /// Closes the running record for `window` as `ok` and advances the
    /// watermark to `window.to`.
    pub async fn mark_done(
        &self,
        window: &TimeWindow,
        rows_read: u64,
        rows_written: u64,
        extra: Extensions,
    ) -> Result<Option<i64>, JournalError> {
        let now = self.now();
        let patch = DetailsPatch::default()
            .with_extensions(extra)
            .with_extension("rows_read", json!(rows_read))
            .with_extension("rows_written", json!(rows_written));
        let close = Transition::to(RunStatus::Ok).closing(now).patch(patch);

        let id = self
            .close(
                RecordFilter::for_process(self.name())
                    .statuses(&[RunStatus::Running])
                    .window(*window),
                &close,
                window,
            )
            .await?;

        self.store
            .upsert_state(
                self.name(),
                &StatePatch::at(now)
                    .status(RunStatus::Ok)
                    .healthy(true)
                    .ok_end(window.to),
            )
            .await?;

        info!(
            process = %self.process(),
            window = %window,
            rows_read,
            rows_written,
            "Window done"
        );
        Ok(id)
    }

    /// Closes the record for `window` as `error`. The watermark is left
    /// where it is.
    pub async fn mark_error(
        &self,
        window: &TimeWindow,
        message: &str,
        component: &str,
        extra: Extensions,
    ) -> Result<Option<i64>, JournalError> {
        let now = self.now();
        let patch = DetailsPatch::default()
            .with_extensions(extra)
            .with_extension("error", json!(message))
            .with_extension("component", json!(component));
        let close = Transition::to(RunStatus::Error).closing(now).patch(patch);

        let id = self
            .close(
                RecordFilter::active(self.name()).window(*window),
                &close,
                window,
            )
            .await?;

        self.store
            .upsert_state(
                self.name(),
                &StatePatch::at(now)
                    .status(RunStatus::Error)
                    .healthy(false)
                    .error(now, component, message),
            )
            .await?;

        warn!(process = %self.process(), window = %window, component, message, "Window failed");
        Ok(id)
    }

    /// Applies `close` to the record `exact` selects, falling back to the
    /// most recent active record of the process.
    async fn close(
        &self,
        exact: RecordFilter,
        close: &Transition,
        window: &TimeWindow,
    ) -> Result<Option<i64>, JournalError> {
        if let Some(id) = self.store.claim_latest(&exact, close).await? {
            return Ok(Some(id));
        }

        let fallback = self
            .store
            .claim_latest(&RecordFilter::active(self.name()), close)
            .await?;
        match fallback {
            Some(id) => warn!(process = %self.process(), window = %window, id, "No record for window, closed latest active record"),
            None => warn!(process = %self.process(), window = %window, "No active record to close"),
        }
        Ok(fallback)
    }

    /// After losing an insert race. `None` means try again: the winner
    /// covers this window (claimed on the next pass), it closed in between,
    /// or it was a stale record for another window that the lock holder just
    /// demoted. `Some(id)` is a winner for another window this caller may
    /// not touch.
    async fn settle_race(&self, window: &TimeWindow) -> Result<Option<i64>, JournalError> {
        let Some(winner) = self
            .store
            .find_latest(&RecordFilter::active(self.name()))
            .await?
        else {
            return Ok(None);
        };

        let Some(other) = winner.window().filter(|w| w != window) else {
            return Ok(None);
        };
        if !self.holds_lock() {
            debug!(process = %self.process(), window = %window, id = winner.id, active = %other, "Reusing active record of another window");
            return Ok(Some(winner.id));
        }

        warn!(process = %self.process(), window = %window, id = winner.id, active = %other, "Demoting active record left for another window");
        self.resolve_active_conflicts(&other, None).await?;
        Ok(None)
    }

    fn new_record(
        &self,
        window: &TimeWindow,
        status: RunStatus,
        host: Option<&str>,
        pid: Option<i32>,
    ) -> NewRecord {
        NewRecord {
            process_name: self.name().to_string(),
            ts_start: self.now(),
            status,
            window: *window,
            heartbeat_ts: None,
            extensions: Extensions::new(),
            host: host.map(str::to_string),
            pid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        state::{Bucket, memory::MemoryJournalStore},
    };
    use model::journal::CloseReason;
    use chrono::TimeZone;

    fn t(m: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(m)
    }

    fn w(from: i64, to: i64) -> TimeWindow {
        TimeWindow::new(t(from), t(to)).unwrap()
    }

    fn journal(store: &MemoryJournalStore, clock: &ManualClock) -> Journal {
        Journal::new(
            Arc::new(store.connect_peer()),
            Arc::new(clock.clone()),
            JournalConfig::new("orders"),
        )
    }

    #[tokio::test]
    async fn planned_is_idempotent_per_window() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        let first = j.mark_planned(&w(0, 15)).await.unwrap();
        let second = j.mark_planned(&w(0, 15)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn another_window_is_reused_without_the_lock() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        let first = j.mark_planned(&w(0, 15)).await.unwrap();
        assert_eq!(j.mark_planned(&w(15, 30)).await.unwrap(), first);
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn lock_holder_demotes_a_record_left_for_a_clipped_window() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(45));
        let j = journal(&store, &clock);
        let stale = j.mark_running(&w(45, 50), None, None).await.unwrap();

        assert!(j.try_acquire_exclusive_lock().await.unwrap());
        clock.advance(TimeDelta::minutes(2));
        let planned = j.mark_planned(&w(45, 60)).await.unwrap();
        assert_ne!(planned, stale);
        assert_eq!(j.mark_running(&w(45, 60), None, None).await.unwrap(), planned);

        let records = store.records().await;
        let old = records.iter().find(|r| r.id == stale).unwrap();
        assert_eq!(old.status, RunStatus::Error);
        assert_eq!(old.details.reason, Some(CloseReason::Conflict));
        assert_eq!(records.iter().filter(|r| r.is_active()).count(), 1);
    }

    #[tokio::test]
    async fn running_claims_the_planned_record() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        let planned = j.mark_planned(&w(0, 15)).await.unwrap();
        clock.advance(TimeDelta::seconds(5));
        let running = j.mark_running(&w(0, 15), Some("host-a"), Some(42)).await.unwrap();
        assert_eq!(planned, running);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Running);
        assert_eq!(records[0].details.heartbeat_ts, Some(t(0) + TimeDelta::seconds(5)));
        assert_eq!(records[0].host.as_deref(), Some("host-a"));
    }

    #[tokio::test]
    async fn running_without_plan_inserts_and_reenters() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        let first = j.mark_running(&w(0, 15), None, None).await.unwrap();
        let again = j.mark_running(&w(0, 15), None, None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn done_advances_watermark_monotonically() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);

        j.mark_running(&w(15, 30), None, None).await.unwrap();
        j.mark_done(&w(15, 30), 10, 10, Extensions::new()).await.unwrap();
        assert_eq!(j.get_watermark().await.unwrap(), Some(t(30)));

        // an older window closing late never moves the watermark back
        j.mark_running(&w(0, 15), None, None).await.unwrap();
        j.mark_done(&w(0, 15), 1, 1, Extensions::new()).await.unwrap();
        assert_eq!(j.get_watermark().await.unwrap(), Some(t(30)));

        let records = store.records().await;
        assert!(records.iter().all(|r| r.status == RunStatus::Ok && r.ts_end.is_some()));
        assert_eq!(records[0].details.extensions.get("rows_read"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn error_freezes_watermark_and_marks_unhealthy() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);

        j.mark_running(&w(0, 15), None, None).await.unwrap();
        j.mark_done(&w(0, 15), 0, 0, Extensions::new()).await.unwrap();
        j.mark_running(&w(15, 30), None, None).await.unwrap();
        j.mark_error(&w(15, 30), "sink down", "sink", Extensions::new())
            .await
            .unwrap();

        let state = j.state().await.unwrap().unwrap();
        assert_eq!(state.last_ok_end, Some(t(15)));
        assert!(!state.healthy);
        assert_eq!(state.last_error_component.as_deref(), Some("sink"));
        assert_eq!(state.last_status, Some(RunStatus::Error));
    }

    #[tokio::test]
    async fn close_falls_back_to_latest_active_record() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        let id = j.mark_running(&w(0, 15), None, None).await.unwrap();
        let closed = j
            .mark_error(&w(30, 45), "boom", "source", Extensions::new())
            .await
            .unwrap();
        assert_eq!(closed, Some(id));
    }

    #[tokio::test]
    async fn heartbeat_is_throttled_and_leaves_ledger_alone() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        j.mark_running(&w(0, 15), None, None).await.unwrap();
        let before = store.records().await;

        assert!(j.heartbeat(Some(json!({"rows": 1}))).await);
        clock.advance(TimeDelta::seconds(10));
        assert!(!j.heartbeat(None).await);
        clock.advance(TimeDelta::seconds(25));
        assert!(j.heartbeat(Some(json!({"rows": 2}))).await);

        assert_eq!(store.records().await, before);
        let state = j.state().await.unwrap().unwrap();
        assert_eq!(state.last_heartbeat, Some(t(0) + TimeDelta::seconds(35)));
        assert_eq!(state.progress, Some(json!({"rows": 2})));
    }

    #[tokio::test]
    async fn heartbeat_swallows_store_failures() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        store.set_unavailable(true);
        assert!(!j.heartbeat(None).await);
    }

    #[tokio::test]
    async fn critical_transitions_propagate_store_failures() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        store.set_unavailable(true);
        assert!(j.mark_planned(&w(0, 15)).await.is_err());
        assert!(j.mark_running(&w(0, 15), None, None).await.is_err());
        assert!(j.mark_done(&w(0, 15), 0, 0, Extensions::new()).await.is_err());
    }

    #[tokio::test]
    async fn derived_journal_is_scoped_separately() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = journal(&store, &clock);
        let dedup = j.derive("dedup");
        assert_eq!(dedup.process().as_str(), "orders:dedup");

        j.mark_running(&w(0, 15), None, None).await.unwrap();
        // the parent's active record does not block the derived process
        dedup.mark_running(&w(0, 15), None, None).await.unwrap();
        dedup.mark_done(&w(0, 15), 0, 0, Extensions::new()).await.unwrap();
        assert_eq!(j.get_watermark().await.unwrap(), None);
    }

    /// Delegates to a memory store, but the first `insert_active` finds a
    /// competing record already inserted between the caller's read and write.
    struct RacingStore {
        inner: MemoryJournalStore,
        competitor: tokio::sync::Mutex<Option<NewRecord>>,
    }

    impl RacingStore {
        fn new(inner: MemoryJournalStore, competitor: NewRecord) -> Self {
            Self {
                inner,
                competitor: tokio::sync::Mutex::new(Some(competitor)),
            }
        }
    }

    #[async_trait::async_trait]
    impl JournalStore for RacingStore {
        async fn ensure_schema(&self) -> Result<(), StoreError> {
            self.inner.ensure_schema().await
        }
        async fn try_advisory_lock(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.try_advisory_lock(key).await
        }
        async fn advisory_unlock(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.advisory_unlock(key).await
        }
        async fn insert_active(&self, record: &NewRecord) -> Result<i64, StoreError> {
            if let Some(competitor) = self.competitor.lock().await.take() {
                self.inner.insert_active(&competitor).await?;
            }
            self.inner.insert_active(record).await
        }
        async fn claim_latest(
            &self,
            filter: &RecordFilter,
            transition: &Transition,
        ) -> Result<Option<i64>, StoreError> {
            self.inner.claim_latest(filter, transition).await
        }
        async fn transition_all(
            &self,
            filter: &RecordFilter,
            transition: &Transition,
        ) -> Result<Vec<i64>, StoreError> {
            self.inner.transition_all(filter, transition).await
        }
        async fn find_latest(
            &self,
            filter: &RecordFilter,
        ) -> Result<Option<JournalRecord>, StoreError> {
            self.inner.find_latest(filter).await
        }
        async fn query(
            &self,
            filter: &RecordFilter,
            limit: usize,
        ) -> Result<Vec<JournalRecord>, StoreError> {
            self.inner.query(filter, limit).await
        }
        async fn load_state(&self, process_name: &str) -> Result<Option<ProcessState>, StoreError> {
            self.inner.load_state(process_name).await
        }
        async fn upsert_state(&self, process_name: &str, patch: &StatePatch) -> Result<(), StoreError> {
            self.inner.upsert_state(process_name, patch).await
        }
        async fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
            self.inner.list_buckets().await
        }
        async fn drop_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
            self.inner.drop_bucket(bucket).await
        }
    }

    fn competing(status: RunStatus, window: TimeWindow) -> NewRecord {
        NewRecord {
            process_name: "orders".into(),
            ts_start: t(0),
            status,
            window,
            heartbeat_ts: None,
            extensions: Extensions::new(),
            host: Some("other-host".into()),
            pid: None,
        }
    }

    fn racing_journal(store: &MemoryJournalStore, clock: &ManualClock, competitor: NewRecord) -> Journal {
        Journal::new(
            Arc::new(RacingStore::new(store.connect_peer(), competitor)),
            Arc::new(clock.clone()),
            JournalConfig::new("orders"),
        )
    }

    #[tokio::test]
    async fn planned_race_reuses_the_winner() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = racing_journal(&store, &clock, competing(RunStatus::Planned, w(0, 15)));

        let id = j.mark_planned(&w(0, 15)).await.unwrap();
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].host.as_deref(), Some("other-host"));
    }

    #[tokio::test]
    async fn running_race_claims_the_winner() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = racing_journal(&store, &clock, competing(RunStatus::Planned, w(0, 15)));

        let id = j.mark_running(&w(0, 15), Some("host-a"), None).await.unwrap();
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].status, RunStatus::Running);
        assert_eq!(records[0].host.as_deref(), Some("host-a"));
    }

    #[tokio::test]
    async fn race_against_another_window_under_the_lock_takes_the_slot() {
        let store = MemoryJournalStore::new();
        let clock = ManualClock::new(t(0));
        let j = racing_journal(&store, &clock, competing(RunStatus::Running, w(0, 5)));
        assert!(j.try_acquire_exclusive_lock().await.unwrap());

        let id = j.mark_planned(&w(0, 15)).await.unwrap();
        let records = store.records().await;
        assert_eq!(records.len(), 2);
        let active: Vec<_> = records.iter().filter(|r| r.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].window(), Some(w(0, 15)));
    }
}
