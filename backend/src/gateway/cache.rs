use std::{future::Future, time::Duration};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client as RedisClient, RedisError, RedisResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{error::GatewayError, filters::QueryParams};

const SCAN_BATCH: usize = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Key for a cached query result: `prefix:base64(query)` followed by
/// `:json(params)` when there are parameters. `QueryParams` is key-sorted so
/// the JSON is canonical.
pub fn cache_key(prefix: &str, query: &str, params: &QueryParams) -> String {
  let encoded = general_purpose::STANDARD.encode(query.as_bytes());
  if params.is_empty() {
    format!("{}:{}", prefix, encoded)
  } else {
    // serializing a map of json values cannot fail
    let params_json = serde_json::to_string(params).unwrap_or_default();
    format!("{}:{}:{}", prefix, encoded, params_json)
  }
}

/// Key-value store holding serialized query results with a server-side expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GatewayError>;

  /// Deletes every key matching a glob pattern and returns how many were removed.
  async fn clear_pattern(&self, pattern: &str) -> Result<usize, GatewayError>;

  async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
  pub host: String,
  pub port: u16,
  pub password: Option<String>,
  pub db: i64,
}

impl RedisSettings {
  pub fn url(&self) -> String {
    match &self.password {
      Some(password) if !password.is_empty() => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
      _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
    }
  }
}

/// One shared connection handle, opened on demand. A handle that failed a
/// command is dropped so the next caller reconnects.
pub struct ConnectionSlot<C> {
  conn: Mutex<Option<C>>,
  connect_timeout: Duration,
}

impl<C: Clone> ConnectionSlot<C> {
  pub fn new(connect_timeout: Duration) -> Self {
    Self { conn: Mutex::new(None), connect_timeout }
  }

  pub async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<C, GatewayError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<C, GatewayError>>,
  {
    let mut guard = self.conn.lock().await;
    if let Some(conn) = guard.as_ref() {
      return Ok(conn.clone());
    }
    let conn = match tokio::time::timeout(self.connect_timeout, connect()).await {
      Ok(conn) => conn?,
      Err(_) => return Err(GatewayError::Cache(format!("connect timed out after {:?}", self.connect_timeout))),
    };
    debug!("redis connection established");
    *guard = Some(conn.clone());
    Ok(conn)
  }

  /// Forgets the current handle. Returns whether one was held.
  pub async fn reset(&self) -> bool {
    self.conn.lock().await.take().is_some()
  }
}

/// Redis-backed cache over a multiplexed connection shared by every request.
pub struct RedisCache {
  client: RedisClient,
  slot: ConnectionSlot<MultiplexedConnection>,
}

impl RedisCache {
  pub fn new(settings: &RedisSettings) -> Result<Self, GatewayError> {
    info!(host = %settings.host, port = settings.port, db = settings.db, "redis cache configured");
    let client = RedisClient::open(settings.url())?;
    Ok(Self { client, slot: ConnectionSlot::new(CONNECT_TIMEOUT) })
  }

  /// Runs `op` on the shared connection within `limit`. Any failure drops the
  /// connection so a restarted server is picked up on the next call.
  async fn run<T, F, Fut>(&self, limit: Duration, op: F) -> Result<T, GatewayError>
  where
    F: FnOnce(MultiplexedConnection) -> Fut,
    Fut: Future<Output = RedisResult<T>>,
  {
    let conn = self.slot
      .get_or_connect(|| async { Ok::<_, GatewayError>(self.client.get_multiplexed_async_connection().await?) })
      .await?;

    let failure = match tokio::time::timeout(limit, op(conn)).await {
      Ok(Ok(value)) => return Ok(value),
      Ok(Err(e)) => GatewayError::from(e),
      Err(_) => GatewayError::Cache(format!("redis command timed out after {:?}", limit)),
    };
    if self.slot.reset().await {
      warn!("dropping redis connection after failure: {}", failure);
    }
    Err(failure)
  }
}

#[async_trait]
impl CacheStore for RedisCache {
  async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
    self.run(COMMAND_TIMEOUT, |mut conn| async move {
      let value: Option<String> = conn.get(key).await?;
      Ok::<_, RedisError>(value)
    }).await
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GatewayError> {
    self.run(COMMAND_TIMEOUT, |mut conn| async move {
      let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
      Ok::<_, RedisError>(())
    }).await
  }

  async fn clear_pattern(&self, pattern: &str) -> Result<usize, GatewayError> {
    let cleared = self.run(SCAN_TIMEOUT, |mut conn| async move {
      let mut cursor: u64 = 0;
      let mut cleared = 0;
      loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
          .arg(cursor)
          .arg("MATCH")
          .arg(pattern)
          .arg("COUNT")
          .arg(SCAN_BATCH)
          .query_async(&mut conn)
          .await?;

        if !keys.is_empty() {
          let removed: usize = conn.del(&keys).await?;
          cleared += removed;
        }
        if next == 0 {
          break;
        }
        cursor = next;
      }
      Ok::<_, RedisError>(cleared)
    }).await?;

    info!(pattern, cleared, "cleared cache keys");
    Ok(cleared)
  }

  async fn close(&self) {
    // dropping the last handle shuts the multiplexed connection down
    if self.slot.reset().await {
      info!("redis connection closed");
    }
  }
}
