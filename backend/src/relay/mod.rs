//! Change relay: polls a table for rows past a watermark and hands them out
//! one frame at a time, sleeping a fixed interval between polls.
//!
//! The relay is a plain state machine. [`Relay::advance`] performs exactly one
//! transition, so tests can drive it step by step; the SSE handler just pulls
//! [`Relay::next_frame`] until it returns `None`.

use std::{collections::VecDeque, sync::Arc, time::Duration};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::gateway::{clickhouse::{QueryClient, Row}, error::GatewayError, filters::{validate_identifier, BoundSql}};

pub const DEFAULT_PAGE_SIZE: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
  pub page_size: u64,
  pub poll_interval: Duration,
}

impl Default for RelaySettings {
  fn default() -> Self {
    Self { page_size: DEFAULT_PAGE_SIZE, poll_interval: DEFAULT_POLL_INTERVAL }
  }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
  Opening,
  Polling,
  Emitting,
  Sleeping,
  Closed,
}

enum State {
  Opening,
  Polling,
  Emitting(VecDeque<Row>),
  Sleeping,
  Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
  Row(Row),
  Error(String),
}

#[derive(Debug, PartialEq)]
pub enum Transition {
  Frame(RelayFrame),
  Continue,
  Closed,
}

pub struct Relay {
  client: Arc<dyn QueryClient>,
  table: String,
  id_column: String,
  settings: RelaySettings,
  watermark: u64,
  state: State,
  released: bool,
}

impl Relay {
  pub fn new(
    client: Arc<dyn QueryClient>,
    table: &str,
    id_column: &str,
    last_update: Option<u64>,
    settings: RelaySettings,
  ) -> Result<Self, GatewayError> {
    validate_identifier(table)?;
    validate_identifier(id_column)?;
    Ok(Self {
      client,
      table: table.to_string(),
      id_column: id_column.to_string(),
      settings,
      watermark: last_update.unwrap_or(0),
      state: State::Opening,
      released: false,
    })
  }

  /// Highest row id handed out so far (or the resume point).
  pub fn watermark(&self) -> u64 {
    self.watermark
  }

  #[cfg(test)]
  pub fn phase(&self) -> RelayPhase {
    match self.state {
      State::Opening => RelayPhase::Opening,
      State::Polling => RelayPhase::Polling,
      State::Emitting(_) => RelayPhase::Emitting,
      State::Sleeping => RelayPhase::Sleeping,
      State::Closed => RelayPhase::Closed,
    }
  }

  fn poll_query(&self) -> BoundSql {
    let mut bound = BoundSql::default();
    let watermark = bound.bind_named("watermark", self.watermark, "UInt64");
    bound.sql = format!(
      "SELECT * FROM {table} WHERE {id} > {watermark} ORDER BY {id} ASC LIMIT {limit}",
      table = self.table,
      id = self.id_column,
      watermark = watermark,
      limit = self.settings.page_size,
    );
    bound
  }

  pub async fn advance(&mut self) -> Transition {
    match std::mem::replace(&mut self.state, State::Closed) {
      State::Opening => {
        info!(table = %self.table, watermark = self.watermark, "relay opened");
        self.state = State::Polling;
        Transition::Continue
      },
      State::Polling => {
        let query = self.poll_query();
        match self.client.query_rows(&query.sql, &query.params).await {
          Ok(rows) => {
            debug!(table = %self.table, rows = rows.len(), watermark = self.watermark, "relay polled");
            self.state = State::Emitting(rows.into());
            Transition::Continue
          },
          Err(e) => {
            warn!(table = %self.table, watermark = self.watermark, "relay poll failed: {}", e);
            self.release().await;
            Transition::Frame(RelayFrame::Error(e.to_string()))
          }
        }
      },
      State::Emitting(mut pending) => match pending.pop_front() {
        Some(row) => {
          match row_id(&row, &self.id_column) {
            Some(id) => self.watermark = self.watermark.max(id),
            None => warn!(table = %self.table, column = %self.id_column, "row without a usable id"),
          }
          self.state = State::Emitting(pending);
          Transition::Frame(RelayFrame::Row(row))
        },
        None => {
          self.state = State::Sleeping;
          Transition::Continue
        }
      },
      State::Sleeping => {
        tokio::time::sleep(self.settings.poll_interval).await;
        self.state = State::Polling;
        Transition::Continue
      },
      State::Closed => Transition::Closed,
    }
  }

  /// Advances until the next frame. `None` once the relay has closed.
  pub async fn next_frame(&mut self) -> Option<RelayFrame> {
    loop {
      match self.advance().await {
        Transition::Frame(frame) => return Some(frame),
        Transition::Continue => {},
        Transition::Closed => return None,
      }
    }
  }

  pub async fn close(&mut self) {
    self.state = State::Closed;
    self.release().await;
  }

  async fn release(&mut self) {
    if !self.released {
      self.released = true;
      self.client.close().await;
      info!(table = %self.table, watermark = self.watermark, "relay closed");
    }
  }
}

impl Drop for Relay {
  // a disconnected client drops the stream mid-flight
  fn drop(&mut self) {
    if self.released {
      return;
    }
    self.released = true;
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let client = self.client.clone();
      let table = std::mem::take(&mut self.table);
      let watermark = self.watermark;
      handle.spawn(async move {
        client.close().await;
        info!(table = %table, watermark, "relay cancelled by client");
      });
    }
  }
}

fn row_id(row: &Row, column: &str) -> Option<u64> {
  match row.get(column)? {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}
