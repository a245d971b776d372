use std::{sync::{atomic::{AtomicBool, Ordering}, Arc}, time::Duration};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{error::GatewayError, filters::QueryParams};

/// One result row. The gateway does not know table schemas, so rows stay
/// untyped key-value maps.
pub type Row = Map<String, Value>;

/// Executes SQL against the analytical store and returns rows.
#[async_trait]
pub trait QueryClient: Send + Sync {
  async fn query_rows(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, GatewayError>;

  /// A handle owned by a single long-lived consumer (a stream), closed
  /// independently of the shared one.
  fn dedicated(&self) -> Arc<dyn QueryClient>;

  async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct ClickHouseSettings {
  pub url: String,
  pub user: String,
  pub password: Option<String>,
  pub database: Option<String>,
  pub request_timeout: Duration,
}

/// ClickHouse over its HTTP interface. Results are requested as JSONEachRow
/// and query parameters travel as `param_<name>` URL arguments.
pub struct ClickHouseClient {
  settings: ClickHouseSettings,
  http: reqwest::Client,
  closed: AtomicBool,
}

impl ClickHouseClient {
  pub fn new(settings: ClickHouseSettings) -> Result<Self, GatewayError> {
    let http = reqwest::Client::builder()
      .timeout(settings.request_timeout)
      .build()?;
    info!(url = %settings.url, database = ?settings.database, "clickhouse client created");
    Ok(Self { settings, http, closed: AtomicBool::new(false) })
  }

  fn url_args(&self, params: &QueryParams) -> Vec<(String, String)> {
    let mut args = vec![("default_format".to_string(), "JSONEachRow".to_string())];
    if let Some(db) = &self.settings.database {
      args.push(("database".to_string(), db.clone()));
    }
    for (name, value) in params {
      let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      args.push((format!("param_{}", name), rendered));
    }
    args
  }
}

#[async_trait]
impl QueryClient for ClickHouseClient {
  async fn query_rows(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, GatewayError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(GatewayError::NotInitialized);
    }

    let mut request = self.http
      .post(&self.settings.url)
      .query(&self.url_args(params))
      .header("X-ClickHouse-User", &self.settings.user)
      .body(sql.to_string());
    if let Some(password) = &self.settings.password {
      request = request.header("X-ClickHouse-Key", password);
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
      return Err(GatewayError::Database(format!("{}: {}", status, body.trim())));
    }

    let rows = parse_rows(&body)?;
    debug!(rows = rows.len(), "clickhouse query returned");
    Ok(rows)
  }

  fn dedicated(&self) -> Arc<dyn QueryClient> {
    // shares the connection pool, owns its own closed flag
    Arc::new(ClickHouseClient {
      settings: self.settings.clone(),
      http: self.http.clone(),
      closed: AtomicBool::new(false),
    })
  }

  async fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      info!(url = %self.settings.url, "clickhouse client closed");
    }
  }
}

/// Parses a ClickHouse response body into rows.
///
/// Accepts JSONEachRow (one object per line) as well as a single JSON document,
/// which is either an array of rows or one row to be wrapped.
pub fn parse_rows(body: &str) -> Result<Vec<Row>, GatewayError> {
  let trimmed = body.trim();
  if trimmed.is_empty() {
    return Ok(vec![]);
  }
  if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
    return rows_from_value(value);
  }

  let mut rows = vec![];
  for line in trimmed.lines().filter(|l| !l.trim().is_empty()) {
    match serde_json::from_str::<Value>(line) {
      Ok(Value::Object(row)) => rows.push(row),
      Ok(other) => return Err(GatewayError::Decode(format!("expected a JSON object per line, got {}", other))),
      Err(e) => return Err(GatewayError::Decode(e.to_string())),
    }
  }
  Ok(rows)
}

/// Normalises a decoded JSON value to a row list; a lone object becomes a
/// one-row list.
pub fn rows_from_value(value: Value) -> Result<Vec<Row>, GatewayError> {
  match value {
    Value::Array(items) => items
      .into_iter()
      .map(|item| match item {
        Value::Object(row) => Ok(row),
        other => Err(GatewayError::Decode(format!("expected a row object, got {}", other))),
      })
      .collect(),
    Value::Object(row) => Ok(vec![row]),
    Value::Null => Ok(vec![]),
    other => Err(GatewayError::Decode(format!("expected rows, got {}", other))),
  }
}
