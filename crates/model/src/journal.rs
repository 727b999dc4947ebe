use crate::window::TimeWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Free-form metadata carried next to the typed fields of a record or state
/// row. Merged key-wise: new keys overlay, absent keys survive.
pub type Extensions = BTreeMap<String, serde_json::Value>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Planned,
    Running,
    Ok,
    Error,
    Skipped,
}

impl RunStatus {
    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Planned, RunStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Planned => "planned",
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Planned | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(RunStatus::Planned),
            "running" => Ok(RunStatus::Running),
            "ok" => Ok(RunStatus::Ok),
            "error" => Ok(RunStatus::Error),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Why a record was closed by something other than its owner.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    HeartbeatTimeout,
    HardTtl,
    PlannedTtl,
    Conflict,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::HardTtl => "hard_ttl",
            CloseReason::PlannedTtl => "planned_ttl",
            CloseReason::Conflict => "conflict",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `details` column of a journal record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RunDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(flatten)]
    pub extensions: Extensions,
}

impl RunDetails {
    pub fn for_window(window: &TimeWindow) -> Self {
        Self {
            slice_from: Some(window.from),
            slice_to: Some(window.to),
            ..Default::default()
        }
    }

    pub fn window(&self) -> Option<TimeWindow> {
        match (self.slice_from, self.slice_to) {
            (Some(from), Some(to)) => TimeWindow::new(from, to).ok(),
            _ => None,
        }
    }
}

/// Partial update of [`RunDetails`]. Only the fields that are set are merged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetailsPatch {
    pub heartbeat_ts: Option<DateTime<Utc>>,
    pub reason: Option<CloseReason>,
    pub extensions: Extensions,
}

impl DetailsPatch {
    pub fn heartbeat(ts: DateTime<Utc>) -> Self {
        Self {
            heartbeat_ts: Some(ts),
            ..Default::default()
        }
    }

    pub fn reason(reason: CloseReason) -> Self {
        Self {
            reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    pub fn with_extensions(mut self, extra: Extensions) -> Self {
        self.extensions.extend(extra);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.heartbeat_ts.is_none() && self.reason.is_none() && self.extensions.is_empty()
    }

    pub fn apply_to(&self, details: &mut RunDetails) {
        if let Some(ts) = self.heartbeat_ts {
            details.heartbeat_ts = Some(ts);
        }
        if let Some(reason) = self.reason {
            details.reason = Some(reason);
        }
        for (k, v) in &self.extensions {
            details.extensions.insert(k.clone(), v.clone());
        }
    }
}

/// One row per run attempt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JournalRecord {
    pub id: i64,
    pub process_name: String,
    pub ts_start: DateTime<Utc>,
    pub ts_end: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub details: RunDetails,
    pub host: Option<String>,
    pub pid: Option<i32>,
}

impl JournalRecord {
    pub fn is_active(&self) -> bool {
        self.status.is_active() && self.ts_end.is_none()
    }

    pub fn window(&self) -> Option<TimeWindow> {
        self.details.window()
    }

    /// Last sign of life: the heartbeat if one was recorded, else the start.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.details.heartbeat_ts.unwrap_or(self.ts_start)
    }
}

/// Aggregated, upserted state of one process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProcessState {
    pub process_name: String,
    pub last_status: Option<RunStatus>,
    pub healthy: bool,
    /// The watermark.
    pub last_ok_end: Option<DateTime<Utc>>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_component: Option<String>,
    pub last_error_message: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub extra: Extensions,
    pub updated_at: DateTime<Utc>,
}

impl ProcessState {
    pub fn empty(process_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            process_name: process_name.to_string(),
            last_status: None,
            healthy: true,
            last_ok_end: None,
            last_started_at: None,
            last_heartbeat: None,
            last_error_at: None,
            last_error_component: None,
            last_error_message: None,
            progress: None,
            extra: Extensions::new(),
            updated_at: now,
        }
    }
}

/// Upsert payload for [`ProcessState`]. `None` leaves a column as it is,
/// `last_ok_end` only ever moves forward, `extra` is merged.
#[derive(Clone, Debug, PartialEq)]
pub struct StatePatch {
    pub updated_at: DateTime<Utc>,
    pub last_status: Option<RunStatus>,
    pub healthy: Option<bool>,
    pub last_ok_end: Option<DateTime<Utc>>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_component: Option<String>,
    pub last_error_message: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub extra: Extensions,
}

impl StatePatch {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            last_status: None,
            healthy: None,
            last_ok_end: None,
            last_started_at: None,
            last_heartbeat: None,
            last_error_at: None,
            last_error_component: None,
            last_error_message: None,
            progress: None,
            extra: Extensions::new(),
        }
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.last_status = Some(status);
        self
    }

    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = Some(healthy);
        self
    }

    pub fn ok_end(mut self, end: DateTime<Utc>) -> Self {
        self.last_ok_end = Some(end);
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.last_started_at = Some(at);
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>, progress: Option<serde_json::Value>) -> Self {
        self.last_heartbeat = Some(at);
        self.progress = progress;
        self
    }

    pub fn error(mut self, at: DateTime<Utc>, component: &str, message: &str) -> Self {
        self.last_error_at = Some(at);
        self.last_error_component = Some(component.to_string());
        self.last_error_message = Some(message.to_string());
        self
    }

    pub fn extra(mut self, extra: Extensions) -> Self {
        self.extra.extend(extra);
        self
    }

    pub fn apply_to(&self, state: &mut ProcessState) {
        state.updated_at = self.updated_at;
        if let Some(status) = self.last_status {
            state.last_status = Some(status);
        }
        if let Some(healthy) = self.healthy {
            state.healthy = healthy;
        }
        if let Some(end) = self.last_ok_end {
            state.last_ok_end = Some(state.last_ok_end.map_or(end, |prev| prev.max(end)));
        }
        if let Some(at) = self.last_started_at {
            state.last_started_at = Some(at);
        }
        if let Some(at) = self.last_heartbeat {
            state.last_heartbeat = Some(at);
        }
        if let Some(at) = self.last_error_at {
            state.last_error_at = Some(at);
        }
        if let Some(component) = &self.last_error_component {
            state.last_error_component = Some(component.clone());
        }
        if let Some(message) = &self.last_error_message {
            state.last_error_message = Some(message.clone());
        }
        if let Some(progress) = &self.progress {
            state.progress = Some(progress.clone());
        }
        for (k, v) in &self.extra {
            state.extra.insert(k.clone(), v.clone());
        }
    }
}
