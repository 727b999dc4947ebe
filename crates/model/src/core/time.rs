//! Canonical instants.
//!
//! Everything the journal persists and everything the slicer compares is a
//! UTC instant truncated to whole milliseconds. Source rows carry their time
//! column in whatever shape the store returns (epoch numbers, ISO text, typed
//! timestamps); [`normalize`] folds all of them into that canonical form.

use crate::core::value::Value;
use chrono::{
    DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc, offset::LocalResult,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Epoch magnitudes at or above this are read as milliseconds.
/// 1e11 seconds is past the year 5000, 1e11 milliseconds is March 1973.
pub const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Error, PartialEq)]
pub enum TimeError {
    #[error("Null or missing time value")]
    Missing,

    #[error("Unsupported time value: {0}")]
    Unsupported(String),

    #[error("Unparseable time text: '{0}'")]
    Unparseable(String),

    #[error("Epoch value out of range: {0}")]
    OutOfRange(i64),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// Drops sub-millisecond precision.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000_000).unwrap_or(ts)
}

/// `2025-01-01T00:00:00.000Z`
pub fn format_canonical(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Converts any supported representation into a canonical instant.
pub fn normalize(value: &Value) -> Result<DateTime<Utc>, TimeError> {
    let ts = match value {
        Value::Null => return Err(TimeError::Missing),
        Value::Timestamp(ts) => *ts,
        Value::Date(d) => midnight_utc(*d),
        Value::Int(n) => from_epoch(*n)?,
        Value::Uint(n) => from_epoch(i64::try_from(*n).map_err(|_| TimeError::OutOfRange(i64::MAX))?)?,
        Value::Float(f) => from_epoch_float(*f)?,
        Value::String(s) => parse_instant(s)?,
        Value::Json(serde_json::Value::String(s)) => parse_instant(s)?,
        Value::Json(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => from_epoch(i)?,
            None => from_epoch_float(n.as_f64().unwrap_or(f64::NAN))?,
        },
        other => return Err(TimeError::Unsupported(format!("{other:?}"))),
    };
    Ok(truncate_millis(ts))
}

/// Parses ISO-8601 / RFC 3339 text or a plain epoch number.
/// Text without an offset is taken as UTC.
pub fn parse_instant(text: &str) -> Result<DateTime<Utc>, TimeError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TimeError::Missing);
    }

    if let Ok(n) = text.parse::<i64>() {
        return from_epoch(n).map(truncate_millis);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(truncate_millis(dt.with_timezone(&Utc)));
    }

    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(truncate_millis(dt.with_timezone(&Utc)));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(truncate_millis(naive.and_utc()));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(midnight_utc(date));
    }

    if let Ok(f) = text.parse::<f64>() {
        return from_epoch_float(f).map(truncate_millis);
    }

    Err(TimeError::Unparseable(text.to_string()))
}

fn from_epoch(n: i64) -> Result<DateTime<Utc>, TimeError> {
    let parsed = if n.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD as u64 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    };
    parsed.ok_or(TimeError::OutOfRange(n))
}

fn from_epoch_float(f: f64) -> Result<DateTime<Utc>, TimeError> {
    if !f.is_finite() {
        return Err(TimeError::Unsupported(f.to_string()));
    }
    let millis = if f.abs() >= EPOCH_MILLIS_THRESHOLD as f64 {
        f.floor()
    } else {
        (f * 1000.0).floor()
    };
    let millis = millis as i64;
    DateTime::from_timestamp_millis(millis).ok_or(TimeError::OutOfRange(millis))
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or_default()
}

/// Start of the calendar day `date` in `tz`, as a UTC instant.
///
/// Days that begin inside a DST gap start at the first valid local time.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let mut naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    for _ in 0..4 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => naive += chrono::TimeDelta::minutes(30),
        }
    }
    midnight_utc(date)
}

/// Timezone used for timestamps shown to humans (CLI output, reports).
///
/// Built once from configuration at process start and handed to whatever
/// formats instants for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayTimezone(Tz);

impl DisplayTimezone {
    pub fn new(tz: Tz) -> Self {
        Self(tz)
    }

    pub fn utc() -> Self {
        Self(Tz::UTC)
    }

    pub fn tz(&self) -> Tz {
        self.0
    }

    pub fn format(&self, ts: &DateTime<Utc>) -> String {
        ts.with_timezone(&self.0)
            .format("%Y-%m-%d %H:%M:%S%.3f %Z")
            .to_string()
    }

    pub fn format_opt(&self, ts: Option<&DateTime<Utc>>) -> String {
        ts.map(|ts| self.format(ts))
            .unwrap_or_else(|| "n/a".to_string())
    }
}

impl Default for DisplayTimezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for DisplayTimezone {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Tz>()
            .map(Self)
            .map_err(|_| TimeError::UnknownTimezone(s.to_string()))
    }
}

impl fmt::Display for DisplayTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn epoch_seconds_and_millis_agree() {
        let expected = utc(2025, 1, 1, 0, 0, 0);
        assert_eq!(normalize(&Value::Int(1_735_689_600)).unwrap(), expected);
        assert_eq!(normalize(&Value::Int(1_735_689_600_000)).unwrap(), expected);
        assert_eq!(
            normalize(&Value::String("1735689600000".into())).unwrap(),
            expected
        );
    }

    #[test]
    fn extreme_epochs_are_rejected() {
        for n in [i64::MIN, i64::MAX, i64::MIN + 1] {
            assert!(matches!(
                normalize(&Value::Int(n)),
                Err(TimeError::OutOfRange(_))
            ));
        }
        assert!(normalize(&Value::Uint(u64::MAX)).is_err());
    }

    #[test]
    fn fractional_epoch_keeps_millis() {
        let ts = normalize(&Value::Float(1_735_689_600.123_9)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_735_689_600_123);
    }

    #[test]
    fn iso_text_variants() {
        let expected = utc(2025, 1, 1, 12, 30, 0);
        for text in [
            "2025-01-01T12:30:00Z",
            "2025-01-01T14:30:00+02:00",
            "2025-01-01 12:30:00",
            "2025-01-01T12:30:00.000",
            "2025-01-01 12:30",
        ] {
            assert_eq!(parse_instant(text).unwrap(), expected, "{text}");
        }
        assert_eq!(
            parse_instant("2025-01-01").unwrap(),
            utc(2025, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn typed_timestamps_are_truncated_to_millis() {
        let raw = utc(2025, 1, 1, 0, 0, 0) + chrono::TimeDelta::nanoseconds(1_234_567);
        let ts = normalize(&Value::Timestamp(raw)).unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 1_000_000);
        assert_eq!(format_canonical(&ts), "2025-01-01T00:00:00.001Z");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize(&Value::Null), Err(TimeError::Missing));
        assert!(matches!(
            normalize(&Value::String("yesterday".into())),
            Err(TimeError::Unparseable(_))
        ));
        assert!(matches!(
            normalize(&Value::Boolean(true)),
            Err(TimeError::Unsupported(_))
        ));
    }

    #[test]
    fn start_of_day_respects_timezone() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        assert_eq!(start_of_day(date, berlin), utc(2024, 12, 31, 23, 0, 0));
        assert_eq!(start_of_day(date, Tz::UTC), utc(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn display_timezone_formats_local_time() {
        let tz: DisplayTimezone = "Asia/Tokyo".parse().unwrap();
        assert_eq!(
            tz.format(&utc(2025, 1, 1, 0, 0, 0)),
            "2025-01-01 09:00:00.000 JST"
        );
        assert!("Mars/Olympus".parse::<DisplayTimezone>().is_err());
    }
}
