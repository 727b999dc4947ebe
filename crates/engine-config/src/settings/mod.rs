use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub mod convert;
pub mod env;
pub mod sections;

pub use sections::{
    DedupSettings, JournalSettings, LoggingSettings, PublishSettings, RetrySettings,
    SanitizeSettings, SinkSettings, SourceSettings,
};

/// Everything one replication process needs. Every section has defaults, so
/// a file only names what differs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Journal process name; one per source-table-to-sink-table pipeline.
    pub process: String,
    pub journal: JournalSettings,
    pub sanitize: SanitizeSettings,
    pub source: SourceSettings,
    pub sink: SinkSettings,
    pub dedup: DedupSettings,
    pub publish: PublishSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// `~/.driftline/config.json`.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let home = dirs::home_dir().ok_or(SettingsError::NoHomeDir)?;
        Ok(home.join(".driftline").join("config.json"))
    }

    pub fn from_json(json: &str, origin: &Path) -> Result<Self, SettingsError> {
        serde_json::from_str(json).map_err(|source| SettingsError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&json, path)
    }

    /// Reads `path`, or the default file when `path` is `None` (a missing
    /// default file means all defaults), then applies process environment
    /// overrides and validates.
    pub async fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_for(path, None).await
    }

    /// Like [`Settings::load`], with `process` taking precedence over both
    /// the file and the environment.
    pub async fn load_for(path: Option<&Path>, process: Option<&str>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path).await?,
            None => {
                let default = Self::default_path()?;
                if tokio::fs::try_exists(&default).await.unwrap_or(false) {
                    Self::from_file(&default).await?
                } else {
                    debug!(path = %default.display(), "No settings file, using defaults");
                    Self::default()
                }
            }
        };

        settings.apply_overrides(std::env::vars());
        if let Some(process) = process {
            settings.process = process.to_string();
        }
        settings.validate()?;
        info!(process = %settings.process, "Settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        require("process", &self.process)?;
        require("journal.dsn", &self.journal.dsn)?;
        require("source.table", &self.source.table)?;
        require("source.time_column", &self.source.time_column)?;
        require("sink.url", &self.sink.url)?;
        require("sink.table", &self.sink.table)?;
        require("sink.ingested_at_column", &self.sink.ingested_at_column)?;

        let key = self
            .dedup
            .key
            .as_ref()
            .ok_or(SettingsError::Missing("dedup.key"))?;
        if key.columns().iter().any(|c| c.trim().is_empty()) {
            return invalid("dedup.key", "key columns must be non-empty");
        }
        if key.contains(&self.sink.ingested_at_column) {
            return invalid("dedup.key", "the ingestion-time column cannot be a key column");
        }

        if !self.sink.url.starts_with("http://") && !self.sink.url.starts_with("https://") {
            return invalid("sink.url", format!("expected an http(s) URL, got '{}'", self.sink.url));
        }
        let (raw, staging) = (self.sink.raw_table(), self.sink.staging_table());
        if raw == self.sink.table || staging == self.sink.table || raw == staging {
            return invalid(
                "sink.staging_table",
                "raw, staging and target tables must all differ",
            );
        }
        if self.sink.batch_size == 0 {
            return invalid("sink.batch_size", "must be at least 1");
        }
        if self.sink.retry.max_attempts == 0 {
            return invalid("sink.retry.max_attempts", "must be at least 1");
        }
        if self.journal.heartbeat_interval_secs == 0 {
            return invalid("journal.heartbeat_interval_secs", "must be positive");
        }
        if self.journal.retention_days == 0 {
            return invalid("journal.retention_days", "must be at least 1");
        }
        if self.sanitize.heartbeat_timeout_secs <= self.journal.heartbeat_interval_secs {
            return invalid(
                "sanitize.heartbeat_timeout_secs",
                "must exceed journal.heartbeat_interval_secs",
            );
        }
        if self.sanitize.hard_ttl_secs < self.sanitize.heartbeat_timeout_secs {
            return invalid(
                "sanitize.hard_ttl_secs",
                "must be at least sanitize.heartbeat_timeout_secs",
            );
        }
        Ok(())
    }
}

fn require(field: &'static str, value: &str) -> Result<(), SettingsError> {
    if value.trim().is_empty() {
        return Err(SettingsError::Missing(field));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), SettingsError> {
    Err(SettingsError::Invalid {
        field,
        reason: reason.into(),
    })
}
