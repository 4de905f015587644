//! ClickHouse HTTP interface transport
//!
//! Statements are POSTed as the request body; inserts send the statement in the `query`
//! parameter and the rows as JSONEachRow in the body.

use crate::config::{ConnectionSettings, Driver, TargetConfig};
use crate::error::{Result, TargetError};
use crate::schema::Row;
use crate::sql::{self, CatalogQuery, Statement};
use crate::transport::Transport;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

lazy_static! {
    static ref ERROR_CODE: Regex = Regex::new(r"Code:\s*(\d+)").expect("valid error code pattern");
}

const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

pub struct HttpTransport {
    client: Client,
    endpoint: String,
    settings: ConnectionSettings,
}

impl HttpTransport {
    pub fn new(settings: ConnectionSettings) -> Result<Self> {
        if settings.driver != Driver::Http {
            return Err(TargetError::Configuration(format!(
                "Driver '{}' is not available in this build, use 'http'",
                settings.driver.as_str()
            )));
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(settings.secure && !settings.verify)
            .build()?;

        Ok(Self {
            client,
            endpoint: settings.http_endpoint(),
            settings,
        })
    }

    pub fn from_config(config: &TargetConfig) -> Result<Self> {
        Self::new(config.connection_settings()?)
    }

    async fn post(&self, params: &[(&str, &str)], body: String) -> Result<Response> {
        let query_id = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("database", self.settings.database.as_str()),
                ("query_id", query_id.as_str()),
            ])
            .query(params)
            .header("X-ClickHouse-User", &self.settings.username)
            .header("X-ClickHouse-Key", &self.settings.password)
            .body(body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await?;
        debug!(query_id = %query_id, status = %status, "Statement rejected");
        Err(parse_server_error(&text))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        let sql = statement.to_sql();
        debug!(table = statement.table(), "{}", sql);
        self.post(&[], sql).await?;
        Ok(())
    }

    async fn query(&self, query: &CatalogQuery) -> Result<Vec<Row>> {
        let sql = format!("{} FORMAT JSONEachRow", query.to_sql());
        trace!("{}", sql);
        let body = self.post(&[], sql).await?.text().await?;
        parse_json_each_row(&body)
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<Option<u64>> {
        let statement = sql::insert_json_rows(table);
        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }

        let response = self
            .post(
                &[("query", statement.as_str()), ("date_time_input_format", "best_effort")],
                body,
            )
            .await?;

        Ok(response
            .headers()
            .get(SUMMARY_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(written_rows))
    }
}

/// Turn an error body (`Code: 60. DB::Exception: ...`) into a server error
pub fn parse_server_error(body: &str) -> TargetError {
    let code = ERROR_CODE
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    TargetError::Server {
        code,
        message: body.trim().to_string(),
    }
}

fn parse_json_each_row(body: &str) -> Result<Vec<Row>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line)? {
            Value::Object(row) => Ok(row),
            other => Err(TargetError::Schema(format!("Expected a JSON object row, got {}", other))),
        })
        .collect()
}

/// `written_rows` from the summary header; ClickHouse sends counters as strings
fn written_rows(summary: &str) -> Option<u64> {
    let summary: Value = serde_json::from_str(summary).ok()?;
    match summary.get("written_rows")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
