use crate::core::time::{format_canonical, truncate_millis};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("Invalid window: from {from} is not before to {to}")]
pub struct WindowError {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Half-open interval `[from, to)` with millisecond-granular UTC bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// Bounds are truncated to milliseconds before validation.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, WindowError> {
        let (from, to) = (truncate_millis(from), truncate_millis(to));
        if from >= to {
            return Err(WindowError { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn duration(&self) -> TimeDelta {
        self.to - self.from
    }

    /// Midpoint rounded down to the millisecond.
    pub fn midpoint(&self) -> DateTime<Utc> {
        let half = TimeDelta::milliseconds(self.duration().num_milliseconds() / 2);
        self.from + half
    }

    /// Bisects at [`midpoint`](Self::midpoint). `None` when the window spans a
    /// single millisecond.
    pub fn split(&self) -> Option<(TimeWindow, TimeWindow)> {
        let mid = self.midpoint();
        if mid <= self.from || mid >= self.to {
            return None;
        }
        Some((
            TimeWindow {
                from: self.from,
                to: mid,
            },
            TimeWindow {
                from: mid,
                to: self.to,
            },
        ))
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.from <= *ts && *ts < self.to
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_canonical(&self.from),
            format_canonical(&self.to)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn rejects_empty_and_inverted_windows() {
        assert!(TimeWindow::new(at(10), at(10)).is_err());
        assert!(TimeWindow::new(at(10), at(5)).is_err());
    }

    #[test]
    fn odd_durations_split_without_gaps() {
        let w = TimeWindow::new(at(0), at(7)).unwrap();
        let (left, right) = w.split().unwrap();
        assert_eq!(left.from, w.from);
        assert_eq!(left.to, right.from);
        assert_eq!(right.to, w.to);
        assert_eq!(left.to, at(3));
    }

    #[test]
    fn single_millisecond_cannot_split() {
        let w = TimeWindow::new(at(0), at(1)).unwrap();
        assert!(w.split().is_none());
    }

    #[test]
    fn half_open_membership() {
        let w = TimeWindow::new(at(0), at(100)).unwrap();
        assert!(w.contains(&at(0)));
        assert!(!w.contains(&at(100)));
        assert_eq!(w.to_string(), "[1970-01-01T00:00:00.000Z, 1970-01-01T00:00:00.100Z)");
    }
}
