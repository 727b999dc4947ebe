use crate::{core::time::start_of_day, window::TimeWindow};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calendar day in the sink timezone; the unit of publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(NaiveDate);

impl PartitionKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn for_instant(ts: &DateTime<Utc>, tz: Tz) -> Self {
        Self(ts.with_timezone(&tz).date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `YYYYMMDD`, matching `toYYYYMMDD` partitioning in the sink.
    pub fn partition_id(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    pub fn from_partition_id(id: &str) -> Option<Self> {
        NaiveDate::parse_from_str(id.trim(), "%Y%m%d").ok().map(Self)
    }

    /// The UTC window this day covers in `tz`.
    pub fn bounds(&self, tz: Tz) -> Option<TimeWindow> {
        let next = self.0.succ_opt()?;
        TimeWindow::new(start_of_day(self.0, tz), start_of_day(next, tz)).ok()
    }

    /// Every day touched by `window`, in order.
    pub fn covering(window: &TimeWindow, tz: Tz) -> Vec<PartitionKey> {
        let first = Self::for_instant(&window.from, tz).0;
        let last = Self::for_instant(&(window.to - TimeDelta::milliseconds(1)), tz).0;
        first
            .iter_days()
            .take_while(|d| *d <= last)
            .map(Self)
            .collect()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.partition_id())
    }
}
