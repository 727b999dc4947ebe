//! Conversions from settings sections into the policies the engine runs on.

use super::Settings;
use chrono::TimeDelta;
use connectors::clickhouse::config::ClickHouseConfig;
use engine_core::{
    journal::{JournalConfig, RetentionPolicy, SanitizePolicy},
    retry::RetryPolicy,
    slicer::SplitPolicy,
};
use std::time::Duration;

fn secs(s: u32) -> TimeDelta {
    TimeDelta::seconds(i64::from(s))
}

impl Settings {
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig::new(self.process.as_str())
            .with_heartbeat_interval(secs(self.journal.heartbeat_interval_secs))
            .with_retention(RetentionPolicy {
                retention_days: self.journal.retention_days,
                prune_interval: secs(self.journal.prune_interval_secs),
            })
    }

    pub fn sanitize_policy(&self) -> SanitizePolicy {
        SanitizePolicy {
            planned_ttl: secs(self.sanitize.planned_ttl_secs),
            heartbeat_timeout: secs(self.sanitize.heartbeat_timeout_secs),
            hard_ttl: secs(self.sanitize.hard_ttl_secs),
        }
    }

    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            min_split: secs(self.source.min_split_secs),
            max_depth: self.source.max_split_depth,
        }
    }

    pub fn step(&self) -> TimeDelta {
        secs(self.source.step_secs)
    }

    pub fn lag(&self) -> TimeDelta {
        secs(self.source.lag_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.sink.retry;
        RetryPolicy::new(
            retry.max_attempts,
            Duration::from_millis(retry.base_delay_ms),
            Duration::from_millis(retry.max_delay_ms),
        )
    }

    pub fn clickhouse_config(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            url: self.sink.url.clone(),
            database: self.sink.database.clone(),
            user: self.sink.user.clone(),
            password: self.sink.password.clone(),
            request_timeout: Duration::from_secs(self.sink.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.sink.connect_timeout_secs),
        }
    }
}
