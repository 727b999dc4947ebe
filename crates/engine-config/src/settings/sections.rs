use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use model::{core::time::DisplayTimezone, dedup::DedupKeySpec};
use serde::{Deserialize, Serialize};

/// Coordination store holding the run ledger and process state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// `postgres://` connection string; `sslmode` is honoured.
    pub dsn: String,
    pub heartbeat_interval_secs: u32,
    pub retention_days: u32,
    pub prune_interval_secs: u32,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            heartbeat_interval_secs: 30,
            retention_days: 30,
            prune_interval_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeSettings {
    pub planned_ttl_secs: u32,
    pub heartbeat_timeout_secs: u32,
    pub hard_ttl_secs: u32,
}

impl Default for SanitizeSettings {
    fn default() -> Self {
        Self {
            planned_ttl_secs: 600,
            heartbeat_timeout_secs: 600,
            hard_ttl_secs: 21_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub table: String,
    pub time_column: String,
    /// Discovered from the source when empty.
    pub columns: Vec<String>,
    /// Length of one slice.
    pub step_secs: u32,
    /// The run stops this far behind "now" to let late writes land.
    pub lag_secs: u32,
    /// Where the first run starts when there is no watermark yet.
    pub start_at: Option<DateTime<Utc>>,
    pub min_split_secs: u32,
    pub max_split_depth: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            table: String::new(),
            time_column: String::new(),
            columns: Vec::new(),
            step_secs: 900,
            lag_secs: 60,
            start_at: None,
            min_split_secs: 60,
            max_split_depth: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Published table, partitioned by day of the time column.
    pub table: String,
    /// Where ingestion appends rows; defaults to `<table>_raw`.
    pub raw_table: Option<String>,
    /// Defaults to `<table>_staging`.
    pub staging_table: Option<String>,
    pub ingested_at_column: String,
    /// Timezone the sink partitions days in.
    pub timezone: Tz,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: None,
            password: None,
            table: String::new(),
            raw_table: None,
            staging_table: None,
            ingested_at_column: "_ingested_at".to_string(),
            timezone: Tz::UTC,
            batch_size: 5_000,
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
            retry: RetrySettings::default(),
        }
    }
}

impl SinkSettings {
    pub fn raw_table(&self) -> String {
        self.raw_table
            .clone()
            .unwrap_or_else(|| format!("{}_raw", self.table))
    }

    pub fn staging_table(&self) -> String {
        self.staging_table
            .clone()
            .unwrap_or_else(|| format!("{}_staging", self.table))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// The three columns identifying a business row.
    pub key: Option<DedupKeySpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    pub enabled: bool,
    /// Skip publishing when fewer than `min_new_rows` arrived since the last
    /// publish.
    pub gate_on_new_rows: bool,
    pub min_new_rows: u64,
    /// Publish after every N completed slices; 0 publishes only at the end of
    /// a run.
    pub every_slices: u32,
    /// At the end of a run also publish partitions with raw rows in the run
    /// bounds that this run did not track.
    pub backfill_missing: bool,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gate_on_new_rows: true,
            min_new_rows: 1,
            every_slices: 0,
            backfill_missing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub display_timezone: DisplayTimezone,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            display_timezone: DisplayTimezone::utc(),
        }
    }
}
