use crate::{
    clickhouse::{
        config::ClickHouseConfig,
        encode::{decode_json_each_row, encode_json_each_row},
    },
    error::{ConnectorError, SinkError},
    sink::Sink,
};
use async_trait::async_trait;
use model::{
    core::utils::{quote_ident, quote_table},
    records::row::RowData,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod config;
pub mod encode;

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

/// ClickHouse over its HTTP interface.
pub struct ClickHouseSink {
    config: ClickHouseConfig,
    client: RwLock<reqwest::Client>,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig) -> Result<Self, ConnectorError> {
        let client = build_client(&config)?;
        Ok(Self {
            config,
            client: RwLock::new(client),
        })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// POSTs `body` with `query` passed as a URL parameter when given.
    async fn send(&self, query: Option<&str>, body: String) -> Result<String, SinkError> {
        let client = self.client.read().await.clone();
        let mut request = client
            .post(self.config.endpoint())
            .query(&[("database", self.config.database.as_str())]);
        if let Some(query) = query {
            request = request.query(&[("query", query)]);
        }
        if let Some(user) = &self.config.user {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request.body(body).send().await.map_err(map_transport)?;
        let status = response.status();
        let code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        let text = response.text().await.map_err(map_transport)?;

        if status.is_success() && code.is_none() {
            return Ok(text);
        }

        Err(SinkError::Server {
            code: code.or_else(|| parse_exception_code(&text)),
            status: status.as_u16(),
            message: text.trim().to_string(),
        })
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn insert_rows(
        &self,
        table: &str,
        rows: &[RowData],
        columns: &[String],
    ) -> Result<u64, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "INSERT INTO {} ({column_list}) FORMAT JSONEachRow",
            quote_table(table)
        );
        let body = encode_json_each_row(rows, columns)?;

        self.send(Some(&query), body).await?;
        debug!(table, rows = rows.len(), "Inserted rows into ClickHouse");
        Ok(rows.len() as u64)
    }

    async fn execute(&self, sql: &str) -> Result<Option<Vec<RowData>>, SinkError> {
        let body = self.send(None, sql.to_string()).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        decode_json_each_row(&body, "query").map(Some)
    }

    async fn table_exists(&self, table: &str) -> Result<bool, SinkError> {
        let body = self
            .send(None, format!("EXISTS TABLE {}", quote_table(table)))
            .await?;
        Ok(body.trim() == "1")
    }

    async fn reconnect(&self) -> Result<(), SinkError> {
        let client = build_client(&self.config).map_err(|e| SinkError::Transport(e.to_string()))?;
        *self.client.write().await = client;
        info!(url = %self.config.url, "ClickHouse client rebuilt");
        Ok(())
    }
}

fn build_client(config: &ClickHouseConfig) -> Result<reqwest::Client, ConnectorError> {
    Ok(reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .build()?)
}

fn map_transport(err: reqwest::Error) -> SinkError {
    if err.is_timeout() {
        SinkError::Timeout(err.to_string())
    } else {
        SinkError::Transport(err.to_string())
    }
}

/// Extracts `123` from bodies shaped like `Code: 123. DB::Exception: ...`.
fn parse_exception_code(body: &str) -> Option<u32> {
    let rest = body.trim_start().strip_prefix("Code:")?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exception_code_from_body() {
        assert_eq!(
            parse_exception_code("Code: 252. DB::Exception: Too many parts"),
            Some(252)
        );
        assert_eq!(parse_exception_code("Internal Server Error"), None);
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let config = ClickHouseConfig::default().with_url("http://ch:8123/");
        assert_eq!(config.endpoint(), "http://ch:8123/");
        assert!(ClickHouseSink::new(config).is_ok());
    }
}
