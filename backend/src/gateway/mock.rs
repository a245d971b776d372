//! In-memory stand-ins for the database and cache clients.

use std::{
  collections::{HashMap, VecDeque},
  sync::{atomic::{AtomicUsize, Ordering}, Arc, Mutex},
  time::Duration,
};
use async_trait::async_trait;
use serde_json::json;

use super::{cache::CacheStore, clickhouse::{QueryClient, Row}, error::GatewayError, filters::QueryParams};

pub fn row(id: u64, desk: &str) -> Row {
  let mut row = Row::new();
  row.insert("id".into(), json!(id));
  row.insert("desk".into(), json!(desk));
  row
}

pub fn rows(ids: std::ops::RangeInclusive<u64>) -> Vec<Row> {
  ids.map(|id| row(id, "Loans")).collect()
}

#[derive(Default)]
struct ClientState {
  pages: VecDeque<Result<Vec<Row>, String>>,
  fallback: Option<Result<Vec<Row>, String>>,
  queries: Vec<(String, QueryParams)>,
}

/// Serves scripted pages in order, then the fallback forever. Clones made via
/// `dedicated` share the script and counters.
#[derive(Clone, Default)]
pub struct MockClient {
  state: Arc<Mutex<ClientState>>,
  calls: Arc<AtomicUsize>,
  closes: Arc<AtomicUsize>,
}

impl MockClient {
  pub fn repeating(rows: Vec<Row>) -> Self {
    let client = Self::default();
    client.state.lock().unwrap().fallback = Some(Ok(rows));
    client
  }

  pub fn failing(message: &str) -> Self {
    let client = Self::default();
    client.state.lock().unwrap().fallback = Some(Err(message.to_string()));
    client
  }

  /// Scripted pages followed by empty results.
  pub fn paged(pages: Vec<Result<Vec<Row>, String>>) -> Self {
    let client = Self::default();
    {
      let mut state = client.state.lock().unwrap();
      state.pages = pages.into();
      state.fallback = Some(Ok(vec![]));
    }
    client
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn closes(&self) -> usize {
    self.closes.load(Ordering::SeqCst)
  }

  pub fn queries(&self) -> Vec<(String, QueryParams)> {
    self.state.lock().unwrap().queries.clone()
  }
}

#[async_trait]
impl QueryClient for MockClient {
  async fn query_rows(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, GatewayError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let mut state = self.state.lock().unwrap();
    state.queries.push((sql.to_string(), params.clone()));
    let next = match state.pages.pop_front() {
      Some(page) => page,
      None => state.fallback.clone().unwrap_or_else(|| Ok(vec![])),
    };
    next.map_err(GatewayError::Database)
  }

  fn dedicated(&self) -> Arc<dyn QueryClient> {
    Arc::new(self.clone())
  }

  async fn close(&self) {
    self.closes.fetch_add(1, Ordering::SeqCst);
  }
}

#[derive(Default)]
pub struct MockCache {
  entries: Mutex<HashMap<String, (String, Duration)>>,
  fail_reads: bool,
  fail_writes: bool,
  closes: AtomicUsize,
}

impl MockCache {
  pub fn failing_reads() -> Self {
    Self { fail_reads: true, ..Default::default() }
  }

  pub fn failing_writes() -> Self {
    Self { fail_writes: true, ..Default::default() }
  }

  pub fn insert(&self, key: &str, value: &str) {
    self.entries.lock().unwrap().insert(key.to_string(), (value.to_string(), Duration::from_secs(60)));
  }

  pub fn ttl_of(&self, key: &str) -> Option<Duration> {
    self.entries.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
  }

  pub fn keys(&self) -> Vec<String> {
    self.entries.lock().unwrap().keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn closes(&self) -> usize {
    self.closes.load(Ordering::SeqCst)
  }
}

// only `*` wildcards, enough for prefix patterns
fn glob_match(pattern: &str, key: &str) -> bool {
  let parts: Vec<&str> = pattern.split('*').collect();
  if parts.len() == 1 {
    return pattern == key;
  }
  let (first, last) = (parts[0], parts[parts.len() - 1]);
  if !key.starts_with(first) || !key[first.len()..].ends_with(last) {
    return false;
  }
  let mut rest = &key[first.len()..key.len() - last.len()];
  for part in &parts[1..parts.len() - 1] {
    match rest.find(part) {
      Some(idx) => rest = &rest[idx + part.len()..],
      None => return false,
    }
  }
  true
}

#[async_trait]
impl CacheStore for MockCache {
  async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
    if self.fail_reads {
      return Err(GatewayError::Cache("connection refused".into()));
    }
    Ok(self.entries.lock().unwrap().get(key).map(|(value, _)| value.clone()))
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GatewayError> {
    if self.fail_writes {
      return Err(GatewayError::Cache("READONLY replica".into()));
    }
    self.entries.lock().unwrap().insert(key.to_string(), (value.to_string(), ttl));
    Ok(())
  }

  async fn clear_pattern(&self, pattern: &str) -> Result<usize, GatewayError> {
    let mut entries = self.entries.lock().unwrap();
    let before = entries.len();
    entries.retain(|key, _| !glob_match(pattern, key));
    Ok(before - entries.len())
  }

  async fn close(&self) {
    self.closes.fetch_add(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_glob_match() {
    assert!(glob_match("ch:*", "ch:abc"));
    assert!(!glob_match("ch:*", "filters:abc"));
    assert!(glob_match("*", "anything"));
    assert!(glob_match("a*c*e", "abcde"));
    assert!(!glob_match("a*c*e", "abde"));
    assert!(glob_match("exact", "exact"));
  }
}
