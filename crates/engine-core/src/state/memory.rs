use crate::{
    error::StoreError,
    state::{Bucket, JournalStore, NewRecord, RecordFilter, Transition},
};
use async_trait::async_trait;
use chrono::NaiveDate;
use model::journal::{JournalRecord, ProcessState, RunDetails, StatePatch};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Shared {
    records: Vec<JournalRecord>,
    states: HashMap<String, ProcessState>,
    /// lock key -> (session, hold count)
    locks: HashMap<String, (u64, u32)>,
    next_id: i64,
}

/// In-process journal store. Handles obtained through
/// [`connect_peer`](Self::connect_peer) see the same data but hold advisory
/// locks as separate sessions, like two connections to one database.
pub struct MemoryJournalStore {
    shared: Arc<Mutex<Shared>>,
    sessions: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    session: u64,
}

impl Default for MemoryJournalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            sessions: Arc::new(AtomicU64::new(1)),
            unavailable: Arc::new(AtomicBool::new(false)),
            session: 0,
        }
    }

    pub fn connect_peer(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sessions: Arc::clone(&self.sessions),
            unavailable: Arc::clone(&self.unavailable),
            session: self.sessions.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Makes every call on every peer fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<JournalRecord> {
        self.shared.lock().await.records.clone()
    }

    async fn shared(&self) -> Result<MutexGuard<'_, Shared>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(self.shared.lock().await)
    }
}

/// Indices of matching records, most recent first.
fn matching(shared: &Shared, filter: &RecordFilter) -> Vec<usize> {
    let mut idx: Vec<usize> = shared
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| filter.matches(r))
        .map(|(i, _)| i)
        .collect();
    idx.sort_by(|a, b| {
        let (ra, rb) = (&shared.records[*a], &shared.records[*b]);
        rb.ts_start.cmp(&ra.ts_start).then(rb.id.cmp(&ra.id))
    });
    idx
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.shared().await.map(|_| ())
    }

    async fn try_advisory_lock(&self, key: &str) -> Result<bool, StoreError> {
        let mut shared = self.shared().await?;
        match shared.locks.get_mut(key) {
            Some((owner, count)) if *owner == self.session => {
                *count += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                shared.locks.insert(key.to_string(), (self.session, 1));
                Ok(true)
            }
        }
    }

    async fn advisory_unlock(&self, key: &str) -> Result<bool, StoreError> {
        let mut shared = self.shared().await?;
        match shared.locks.get_mut(key) {
            Some((owner, count)) if *owner == self.session => {
                *count -= 1;
                if *count == 0 {
                    shared.locks.remove(key);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_active(&self, record: &NewRecord) -> Result<i64, StoreError> {
        let mut shared = self.shared().await?;
        if shared
            .records
            .iter()
            .any(|r| r.process_name == record.process_name && r.is_active())
        {
            return Err(StoreError::UniqueViolation(format!(
                "active record exists for {}",
                record.process_name
            )));
        }

        shared.next_id += 1;
        let id = shared.next_id;
        let mut details = RunDetails::for_window(&record.window);
        details.heartbeat_ts = record.heartbeat_ts;
        details.extensions = record.extensions.clone();
        shared.records.push(JournalRecord {
            id,
            process_name: record.process_name.clone(),
            ts_start: record.ts_start,
            ts_end: None,
            status: record.status,
            details,
            host: record.host.clone(),
            pid: record.pid,
        });
        Ok(id)
    }

    async fn claim_latest(
        &self,
        filter: &RecordFilter,
        transition: &Transition,
    ) -> Result<Option<i64>, StoreError> {
        let mut shared = self.shared().await?;
        let Some(&i) = matching(&shared, filter).first() else {
            return Ok(None);
        };
        let record = &mut shared.records[i];
        transition.apply_to(record);
        Ok(Some(record.id))
    }

    async fn transition_all(
        &self,
        filter: &RecordFilter,
        transition: &Transition,
    ) -> Result<Vec<i64>, StoreError> {
        let mut shared = self.shared().await?;
        let mut ids = Vec::new();
        for i in matching(&shared, filter) {
            let record = &mut shared.records[i];
            transition.apply_to(record);
            ids.push(record.id);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn find_latest(&self, filter: &RecordFilter) -> Result<Option<JournalRecord>, StoreError> {
        let shared = self.shared().await?;
        Ok(matching(&shared, filter)
            .first()
            .map(|&i| shared.records[i].clone()))
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<JournalRecord>, StoreError> {
        let shared = self.shared().await?;
        Ok(matching(&shared, filter)
            .into_iter()
            .take(limit)
            .map(|i| shared.records[i].clone())
            .collect())
    }

    async fn load_state(&self, process_name: &str) -> Result<Option<ProcessState>, StoreError> {
        Ok(self.shared().await?.states.get(process_name).cloned())
    }

    async fn upsert_state(&self, process_name: &str, patch: &StatePatch) -> Result<(), StoreError> {
        let mut shared = self.shared().await?;
        let state = shared
            .states
            .entry(process_name.to_string())
            .or_insert_with(|| ProcessState::empty(process_name, patch.updated_at));
        patch.apply_to(state);
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
        let shared = self.shared().await?;
        let days: BTreeSet<NaiveDate> = shared
            .records
            .iter()
            .map(|r| r.ts_start.date_naive())
            .collect();
        Ok(days.into_iter().map(Bucket::for_day).collect())
    }

    async fn drop_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        let mut shared = self.shared().await?;
        shared
            .records
            .retain(|r| r.ts_start.date_naive() != bucket.day);
        Ok(())
    }
}
