use chrono::{DateTime, Utc};
use model::{
    journal::{DetailsPatch, Extensions, JournalRecord, RunStatus},
    window::TimeWindow,
};

/// Which journal rows an operation applies to. Each set field narrows the
/// selection; the process name is always required.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub process_name: String,
    /// Empty means any status.
    pub statuses: Vec<RunStatus>,
    /// Only rows without `ts_end`.
    pub active_only: bool,
    /// Exact `slice_from`/`slice_to` match.
    pub window: Option<TimeWindow>,
    pub exclude_id: Option<i64>,
    pub started_before: Option<DateTime<Utc>>,
    /// Heartbeat, or start when no heartbeat was recorded, before this.
    pub last_seen_before: Option<DateTime<Utc>>,
    pub without_heartbeat: bool,
}

impl RecordFilter {
    pub fn for_process(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            statuses: Vec::new(),
            active_only: false,
            window: None,
            exclude_id: None,
            started_before: None,
            last_seen_before: None,
            without_heartbeat: false,
        }
    }

    /// Open `planned` or `running` rows.
    pub fn active(process_name: &str) -> Self {
        Self::for_process(process_name).statuses(&RunStatus::ACTIVE)
    }

    pub fn statuses(mut self, statuses: &[RunStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self.active_only = statuses.iter().all(RunStatus::is_active) && !statuses.is_empty();
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn excluding(mut self, id: i64) -> Self {
        self.exclude_id = Some(id);
        self
    }

    pub fn started_before(mut self, ts: DateTime<Utc>) -> Self {
        self.started_before = Some(ts);
        self
    }

    pub fn last_seen_before(mut self, ts: DateTime<Utc>) -> Self {
        self.last_seen_before = Some(ts);
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.without_heartbeat = true;
        self
    }

    pub fn matches(&self, record: &JournalRecord) -> bool {
        if record.process_name != self.process_name {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if self.active_only && record.ts_end.is_some() {
            return false;
        }
        if let Some(window) = &self.window
            && (record.details.slice_from != Some(window.from)
                || record.details.slice_to != Some(window.to))
        {
            return false;
        }
        if self.exclude_id == Some(record.id) {
            return false;
        }
        if let Some(ts) = self.started_before
            && record.ts_start >= ts
        {
            return false;
        }
        if let Some(ts) = self.last_seen_before
            && record.last_seen() >= ts
        {
            return false;
        }
        if self.without_heartbeat && record.details.heartbeat_ts.is_some() {
            return false;
        }
        true
    }
}

/// One conditional update applied to the rows a [`RecordFilter`] selects.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub status: RunStatus,
    /// Stamps `ts_end` and frees the process's active slot.
    pub close_at: Option<DateTime<Utc>>,
    pub patch: DetailsPatch,
    pub host: Option<String>,
    pub pid: Option<i32>,
}

impl Transition {
    pub fn to(status: RunStatus) -> Self {
        Self {
            status,
            close_at: None,
            patch: DetailsPatch::default(),
            host: None,
            pid: None,
        }
    }

    pub fn closing(mut self, at: DateTime<Utc>) -> Self {
        self.close_at = Some(at);
        self
    }

    pub fn patch(mut self, patch: DetailsPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn owner(mut self, host: Option<String>, pid: Option<i32>) -> Self {
        self.host = host;
        self.pid = pid;
        self
    }

    pub fn apply_to(&self, record: &mut JournalRecord) {
        record.status = self.status;
        if let Some(at) = self.close_at {
            record.ts_end = Some(at);
        }
        self.patch.apply_to(&mut record.details);
        if self.host.is_some() {
            record.host = self.host.clone();
        }
        if self.pid.is_some() {
            record.pid = self.pid;
        }
    }
}

/// An active record to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub process_name: String,
    pub ts_start: DateTime<Utc>,
    pub status: RunStatus,
    pub window: TimeWindow,
    pub heartbeat_ts: Option<DateTime<Utc>>,
    pub extensions: Extensions,
    pub host: Option<String>,
    pub pid: Option<i32>,
}
