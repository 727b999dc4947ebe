use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use model::journal::{JournalRecord, ProcessState, StatePatch};

pub mod filter;
pub mod memory;
pub mod postgres;

pub use filter::{NewRecord, RecordFilter, Transition};

/// One daily chunk of the run ledger, keyed by the UTC day of `ts_start`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bucket {
    pub name: String,
    pub day: NaiveDate,
}

impl Bucket {
    pub fn for_day(day: NaiveDate) -> Self {
        Self {
            name: format!("run_journal_p{}", day.format("%Y%m%d")),
            day,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let suffix = name.strip_prefix("run_journal_p")?;
        let day = NaiveDate::parse_from_str(suffix, "%Y%m%d").ok()?;
        Some(Self {
            name: name.to_string(),
            day,
        })
    }

    pub fn lower_bound(&self) -> DateTime<Utc> {
        self.day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
    }

    /// Exclusive upper bound.
    pub fn upper_bound(&self) -> DateTime<Utc> {
        self.day
            .succ_opt()
            .unwrap_or(self.day)
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc()
    }
}

/// Persistence for the run ledger, aggregated process state and advisory
/// locks.
///
/// Each method is one auto-committed statement. At most one active record
/// per process may exist; `insert_active` fails with
/// [`StoreError::UniqueViolation`] when that slot is taken, and closing
/// transitions release it in the same statement.
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn try_advisory_lock(&self, key: &str) -> Result<bool, StoreError>;
    async fn advisory_unlock(&self, key: &str) -> Result<bool, StoreError>;

    async fn insert_active(&self, record: &NewRecord) -> Result<i64, StoreError>;

    /// Atomically applies `transition` to the most recent matching record
    /// and returns its id, or `None` when nothing matched.
    async fn claim_latest(
        &self,
        filter: &RecordFilter,
        transition: &Transition,
    ) -> Result<Option<i64>, StoreError>;

    /// Applies `transition` to every matching record.
    async fn transition_all(
        &self,
        filter: &RecordFilter,
        transition: &Transition,
    ) -> Result<Vec<i64>, StoreError>;

    async fn find_latest(&self, filter: &RecordFilter) -> Result<Option<JournalRecord>, StoreError>;

    /// Most recent first.
    async fn query(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<JournalRecord>, StoreError>;

    async fn load_state(&self, process_name: &str) -> Result<Option<ProcessState>, StoreError>;
    async fn upsert_state(&self, process_name: &str, patch: &StatePatch) -> Result<(), StoreError>;

    /// Oldest first.
    async fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError>;
    async fn drop_bucket(&self, bucket: &Bucket) -> Result<(), StoreError>;
}
