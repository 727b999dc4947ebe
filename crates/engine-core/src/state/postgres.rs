use crate::{
    error::StoreError,
    state::{Bucket, JournalStore, NewRecord, RecordFilter, Transition},
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use connectors::postgres::connect_client;
use model::journal::{
    CloseReason, Extensions, JournalRecord, ProcessState, RunDetails, RunStatus, StatePatch,
};
use serde_json::Value as Json;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row, error::SqlState, types::ToSql};
use tracing::{debug, info};

const RECORD_COLUMNS: &str = "id, process_name, ts_start, ts_end, status, slice_from, slice_to, \
                              heartbeat_ts, details, host, pid";

const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS run_journal_id_seq;

CREATE TABLE IF NOT EXISTS run_journal (
    id           BIGINT      NOT NULL DEFAULT nextval('run_journal_id_seq'),
    process_name TEXT        NOT NULL,
    ts_start     TIMESTAMPTZ NOT NULL,
    ts_end       TIMESTAMPTZ NULL,
    status       TEXT        NOT NULL
                 CHECK (status IN ('planned', 'running', 'ok', 'error', 'skipped')),
    slice_from   TIMESTAMPTZ NULL,
    slice_to     TIMESTAMPTZ NULL,
    heartbeat_ts TIMESTAMPTZ NULL,
    details      JSONB       NOT NULL DEFAULT '{}'::jsonb,
    host         TEXT        NULL,
    pid          INTEGER     NULL,
    PRIMARY KEY (process_name, ts_start, id)
) PARTITION BY RANGE (ts_start);

CREATE INDEX IF NOT EXISTS run_journal_open_idx
    ON run_journal (process_name, status) WHERE ts_end IS NULL;

CREATE TABLE IF NOT EXISTS run_journal_active (
    process_name TEXT        PRIMARY KEY,
    record_id    BIGINT      NOT NULL,
    slice_from   TIMESTAMPTZ NULL,
    slice_to     TIMESTAMPTZ NULL
);

CREATE TABLE IF NOT EXISTS process_state (
    process_name         TEXT        PRIMARY KEY,
    last_status          TEXT        NULL,
    healthy              BOOLEAN     NOT NULL DEFAULT TRUE,
    last_ok_end          TIMESTAMPTZ NULL,
    last_started_at      TIMESTAMPTZ NULL,
    last_heartbeat       TIMESTAMPTZ NULL,
    last_error_at        TIMESTAMPTZ NULL,
    last_error_component TEXT        NULL,
    last_error_message   TEXT        NULL,
    progress             JSONB       NULL,
    extra                JSONB       NOT NULL DEFAULT '{}'::jsonb,
    updated_at           TIMESTAMPTZ NOT NULL
);
"#;

/// Positional parameters collected while a statement is rendered.
#[derive(Default)]
struct SqlParams {
    values: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl SqlParams {
    /// Adds a value and returns its placeholder.
    fn push<T: ToSql + Sync + Send + 'static>(&mut self, value: T) -> String {
        self.values.push(Box::new(value));
        format!("${}", self.values.len())
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Renders `filter` as a `WHERE` body over unqualified `run_journal` columns.
fn render_filter(filter: &RecordFilter, params: &mut SqlParams) -> String {
    let mut clauses = vec![format!(
        "process_name = {}",
        params.push(filter.process_name.clone())
    )];

    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        clauses.push(format!("status = ANY({}::text[])", params.push(statuses)));
    }
    if filter.active_only {
        clauses.push("ts_end IS NULL".to_string());
    }
    if let Some(window) = &filter.window {
        clauses.push(format!(
            "slice_from = {}::timestamptz AND slice_to = {}::timestamptz",
            params.push(window.from),
            params.push(window.to)
        ));
    }
    if let Some(id) = filter.exclude_id {
        clauses.push(format!("id <> {}::bigint", params.push(id)));
    }
    if let Some(ts) = filter.started_before {
        clauses.push(format!("ts_start < {}::timestamptz", params.push(ts)));
    }
    if let Some(ts) = filter.last_seen_before {
        clauses.push(format!(
            "COALESCE(heartbeat_ts, ts_start) < {}::timestamptz",
            params.push(ts)
        ));
    }
    if filter.without_heartbeat {
        clauses.push("heartbeat_ts IS NULL".to_string());
    }

    clauses.join(" AND ")
}

/// `details` keys other than the typed columns.
fn details_json(reason: Option<CloseReason>, extensions: &Extensions) -> Json {
    let mut obj: serde_json::Map<String, Json> = extensions
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(reason) = reason {
        obj.insert("reason".into(), Json::String(reason.as_str().to_string()));
    }
    Json::Object(obj)
}

/// Renders the claim statement shared by `claim_latest` and
/// `transition_all`: lock the selected rows, update them, and drop the
/// active-slot guard when the transition closes the record.
fn render_transition(
    filter: &RecordFilter,
    transition: &Transition,
    single: bool,
) -> (String, SqlParams) {
    let mut params = SqlParams::default();
    let status = params.push(transition.status.as_str().to_string());
    let close_at = params.push(transition.close_at);
    let heartbeat = params.push(transition.patch.heartbeat_ts);
    let patch = params.push(details_json(
        transition.patch.reason,
        &transition.patch.extensions,
    ));
    let host = params.push(transition.host.clone());
    let pid = params.push(transition.pid);
    let where_clause = render_filter(filter, &mut params);
    let limit = if single {
        "ORDER BY ts_start DESC, id DESC LIMIT 1"
    } else {
        ""
    };

    let sql = format!(
        r#"
WITH target AS (
    SELECT id, ts_start FROM run_journal
    WHERE {where_clause}
    {limit}
    FOR UPDATE SKIP LOCKED
),
claimed AS (
    UPDATE run_journal j SET
        status = {status}::text,
        ts_end = COALESCE({close_at}::timestamptz, j.ts_end),
        heartbeat_ts = COALESCE({heartbeat}::timestamptz, j.heartbeat_ts),
        details = j.details || {patch}::jsonb,
        host = COALESCE({host}::text, j.host),
        pid = COALESCE({pid}::integer, j.pid)
    FROM target
    WHERE j.id = target.id AND j.ts_start = target.ts_start
    RETURNING j.id, j.process_name
),
released AS (
    DELETE FROM run_journal_active a
    USING claimed
    WHERE {close_at}::timestamptz IS NOT NULL
      AND a.process_name = claimed.process_name
      AND a.record_id = claimed.id
    RETURNING a.record_id
)
SELECT id FROM claimed ORDER BY id
"#
    );
    (sql, params)
}

fn decode_record(row: &Row) -> Result<JournalRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<RunStatus>().map_err(StoreError::Decode)?;
    let details: Json = row.try_get("details")?;

    let mut extensions = Extensions::new();
    let mut reason = None;
    if let Json::Object(map) = details {
        for (key, value) in map {
            if key == "reason" {
                reason = serde_json::from_value::<CloseReason>(value.clone()).ok();
                if reason.is_some() {
                    continue;
                }
            }
            extensions.insert(key, value);
        }
    }

    Ok(JournalRecord {
        id: row.try_get("id")?,
        process_name: row.try_get("process_name")?,
        ts_start: row.try_get("ts_start")?,
        ts_end: row.try_get("ts_end")?,
        status,
        details: RunDetails {
            slice_from: row.try_get("slice_from")?,
            slice_to: row.try_get("slice_to")?,
            heartbeat_ts: row.try_get("heartbeat_ts")?,
            reason,
            extensions,
        },
        host: row.try_get("host")?,
        pid: row.try_get("pid")?,
    })
}

fn decode_state(row: &Row) -> Result<ProcessState, StoreError> {
    let last_status: Option<String> = row.try_get("last_status")?;
    let last_status = last_status
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(StoreError::Decode)?;
    let extra: Json = row.try_get("extra")?;
    let extra = match extra {
        Json::Object(map) => map.into_iter().collect(),
        _ => Extensions::new(),
    };

    Ok(ProcessState {
        process_name: row.try_get("process_name")?,
        last_status,
        healthy: row.try_get("healthy")?,
        last_ok_end: row.try_get("last_ok_end")?,
        last_started_at: row.try_get("last_started_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        last_error_at: row.try_get("last_error_at")?,
        last_error_component: row.try_get("last_error_component")?,
        last_error_message: row.try_get("last_error_message")?,
        progress: row.try_get("progress")?,
        extra,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Journal store on PostgreSQL.
///
/// `run_journal` is range-partitioned by `ts_start` into daily buckets that
/// are created on first use. The one-active-record rule lives in the
/// unpartitioned `run_journal_active` table, written in the same statement
/// as the ledger row it guards. Advisory locks are session-scoped, so the
/// store keeps a single connection for its whole lifetime.
pub struct PgJournalStore {
    client: Arc<Mutex<Client>>,
    known_buckets: Mutex<HashSet<NaiveDate>>,
}

impl PgJournalStore {
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let client = connect_client(dsn).await?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            known_buckets: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_bucket(&self, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let day = ts.date_naive();
        if self.known_buckets.lock().await.contains(&day) {
            return Ok(());
        }

        let bucket = Bucket::for_day(day);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF run_journal \
             FOR VALUES FROM ('{}') TO ('{}')",
            bucket.name,
            bucket.lower_bound().format("%Y-%m-%d %H:%M:%S+00"),
            bucket.upper_bound().format("%Y-%m-%d %H:%M:%S+00"),
        );

        let client = self.client.lock().await;
        match client.batch_execute(&sql).await {
            Ok(()) => {}
            // lost a creation race with another instance
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_TABLE) => {}
            Err(e) => return Err(e.into()),
        }
        drop(client);

        debug!(bucket = %bucket.name, "Journal bucket ready");
        self.known_buckets.lock().await.insert(day);
        Ok(())
    }
}

#[async_trait]
impl JournalStore for PgJournalStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        let kind = client
            .query_opt(
                "SELECT c.relkind::text AS relkind FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relname = 'run_journal' AND n.nspname = current_schema()",
                &[],
            )
            .await?;
        if let Some(row) = kind {
            let relkind: String = row.try_get("relkind")?;
            if relkind != "p" {
                return Err(StoreError::NotBucketed("run_journal".to_string()));
            }
        }

        client.batch_execute(SCHEMA).await?;
        info!("Journal schema ensured");
        Ok(())
    }

    async fn try_advisory_lock(&self, key: &str) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_one("SELECT pg_try_advisory_lock(hashtext($1)::bigint)", &[&key])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn advisory_unlock(&self, key: &str) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_one("SELECT pg_advisory_unlock(hashtext($1)::bigint)", &[&key])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn insert_active(&self, record: &NewRecord) -> Result<i64, StoreError> {
        self.ensure_bucket(record.ts_start).await?;

        let details = details_json(None, &record.extensions);
        let status = record.status.as_str();
        let client = self.client.lock().await;
        let row = client
            .query_one(
                r#"
WITH new_id AS (
    SELECT nextval('run_journal_id_seq') AS id
),
guard AS (
    INSERT INTO run_journal_active (process_name, record_id, slice_from, slice_to)
    SELECT $1::text, id, $4::timestamptz, $5::timestamptz FROM new_id
    RETURNING record_id
)
INSERT INTO run_journal
    (id, process_name, ts_start, status, slice_from, slice_to, heartbeat_ts, details, host, pid)
SELECT record_id, $1::text, $2::timestamptz, $3::text, $4::timestamptz, $5::timestamptz,
       $6::timestamptz, $7::jsonb, $8::text, $9::integer
FROM guard
RETURNING id
"#,
                &[
                    &record.process_name,
                    &record.ts_start,
                    &status,
                    &record.window.from,
                    &record.window.to,
                    &record.heartbeat_ts,
                    &details,
                    &record.host,
                    &record.pid,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn claim_latest(
        &self,
        filter: &RecordFilter,
        transition: &Transition,
    ) -> Result<Option<i64>, StoreError> {
        let (sql, params) = render_transition(filter, transition, true);
        let client = self.client.lock().await;
        let row = client.query_opt(&sql, &params.refs()).await?;
        row.map(|r| r.try_get::<_, i64>("id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn transition_all(
        &self,
        filter: &RecordFilter,
        transition: &Transition,
    ) -> Result<Vec<i64>, StoreError> {
        let (sql, params) = render_transition(filter, transition, false);
        let client = self.client.lock().await;
        let rows = client.query(&sql, &params.refs()).await?;
        rows.iter()
            .map(|r| r.try_get::<_, i64>("id").map_err(Into::into))
            .collect()
    }

    async fn find_latest(&self, filter: &RecordFilter) -> Result<Option<JournalRecord>, StoreError> {
        Ok(self.query(filter, 1).await?.into_iter().next())
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<JournalRecord>, StoreError> {
        let mut params = SqlParams::default();
        let where_clause = render_filter(filter, &mut params);
        let limit = params.push(i64::try_from(limit).unwrap_or(i64::MAX));
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM run_journal WHERE {where_clause} \
             ORDER BY ts_start DESC, id DESC LIMIT {limit}::bigint"
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &params.refs()).await?;
        rows.iter().map(decode_record).collect()
    }

    async fn load_state(&self, process_name: &str) -> Result<Option<ProcessState>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT process_name, last_status, healthy, last_ok_end, last_started_at, \
                 last_heartbeat, last_error_at, last_error_component, last_error_message, \
                 progress, extra, updated_at FROM process_state WHERE process_name = $1",
                &[&process_name],
            )
            .await?;
        row.as_ref().map(decode_state).transpose()
    }

    async fn upsert_state(&self, process_name: &str, patch: &StatePatch) -> Result<(), StoreError> {
        let status = patch.last_status.map(|s| s.as_str().to_string());
        let extra = Json::Object(
            patch
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let client = self.client.lock().await;
        client
            .execute(
                r#"
INSERT INTO process_state AS s (
    process_name, last_status, healthy, last_ok_end, last_started_at, last_heartbeat,
    last_error_at, last_error_component, last_error_message, progress, extra, updated_at
) VALUES (
    $1::text, $2::text, COALESCE($3::boolean, TRUE), $4::timestamptz, $5::timestamptz,
    $6::timestamptz, $7::timestamptz, $8::text, $9::text, $10::jsonb, $11::jsonb, $12::timestamptz
)
ON CONFLICT (process_name) DO UPDATE SET
    last_status          = COALESCE(EXCLUDED.last_status, s.last_status),
    healthy              = COALESCE($3::boolean, s.healthy),
    last_ok_end          = GREATEST(s.last_ok_end, EXCLUDED.last_ok_end),
    last_started_at      = COALESCE(EXCLUDED.last_started_at, s.last_started_at),
    last_heartbeat       = COALESCE(EXCLUDED.last_heartbeat, s.last_heartbeat),
    last_error_at        = COALESCE(EXCLUDED.last_error_at, s.last_error_at),
    last_error_component = COALESCE(EXCLUDED.last_error_component, s.last_error_component),
    last_error_message   = COALESCE(EXCLUDED.last_error_message, s.last_error_message),
    progress             = COALESCE(EXCLUDED.progress, s.progress),
    extra                = s.extra || EXCLUDED.extra,
    updated_at           = EXCLUDED.updated_at
"#,
                &[
                    &process_name,
                    &status,
                    &patch.healthy,
                    &patch.last_ok_end,
                    &patch.last_started_at,
                    &patch.last_heartbeat,
                    &patch.last_error_at,
                    &patch.last_error_component,
                    &patch.last_error_message,
                    &patch.progress,
                    &extra,
                    &patch.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT c.relname::text AS name FROM pg_inherits i \
                 JOIN pg_class c ON c.oid = i.inhrelid \
                 JOIN pg_class p ON p.oid = i.inhparent \
                 WHERE p.relname = 'run_journal'",
                &[],
            )
            .await?;
        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            if let Some(bucket) = Bucket::from_name(&name) {
                buckets.push(bucket);
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    async fn drop_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        // names come from Bucket::for_day / from_name, both fixed-format
        let client = self.client.lock().await;
        client
            .batch_execute(&format!(
                "ALTER TABLE run_journal DETACH PARTITION {name}; DROP TABLE IF EXISTS {name};",
                name = bucket.name
            ))
            .await?;
        client
            .execute(
                "DELETE FROM run_journal_active a WHERE NOT EXISTS \
                 (SELECT 1 FROM run_journal j WHERE j.id = a.record_id)",
                &[],
            )
            .await?;
        drop(client);

        self.known_buckets.lock().await.remove(&bucket.day);
        info!(bucket = %bucket.name, "Dropped journal bucket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use model::{journal::DetailsPatch, window::TimeWindow};

    #[test]
    fn filter_renders_every_clause_with_numbered_params() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let filter = RecordFilter::active("orders")
            .window(TimeWindow::new(at, at + TimeDelta::minutes(15)).unwrap())
            .excluding(7)
            .last_seen_before(at);
        let mut params = SqlParams::default();
        let sql = render_filter(&filter, &mut params);
        assert_eq!(
            sql,
            "process_name = $1 AND status = ANY($2::text[]) AND ts_end IS NULL \
             AND slice_from = $3::timestamptz AND slice_to = $4::timestamptz \
             AND id <> $5::bigint AND COALESCE(heartbeat_ts, ts_start) < $6::timestamptz"
        );
        assert_eq!(params.values.len(), 6);
    }

    #[test]
    fn claim_statement_locks_one_row_and_releases_guard() {
        let transition = Transition::to(RunStatus::Ok)
            .closing(Utc::now())
            .patch(DetailsPatch::reason(CloseReason::Conflict));
        let (sql, params) = render_transition(&RecordFilter::active("p"), &transition, true);
        assert!(sql.contains("LIMIT 1"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("DELETE FROM run_journal_active"));
        // six transition params, then process name and statuses
        assert_eq!(params.values.len(), 8);
        assert!(sql.contains("process_name = $7"));
    }

    #[test]
    fn reason_is_stored_next_to_extensions() {
        let mut ext = Extensions::new();
        ext.insert("rows_read".into(), serde_json::json!(3));
        let json = details_json(Some(CloseReason::HardTtl), &ext);
        assert_eq!(json, serde_json::json!({"rows_read": 3, "reason": "hard_ttl"}));
    }
}
