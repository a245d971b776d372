//! Query-cache gateway: turns dashboard filters into bound ClickHouse SQL,
//! runs it, and keeps JSON results in Redis for a fixed time-to-live.

pub mod cache;
pub mod clickhouse;
pub mod dates;
pub mod error;
pub mod filters;

#[cfg(test)]
pub mod mock;

use std::{fmt, sync::{atomic::{AtomicBool, Ordering}, Arc}, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use cache::{cache_key, CacheStore, RedisCache, RedisSettings};
use clickhouse::{rows_from_value, ClickHouseClient, ClickHouseSettings, QueryClient, Row};
use error::GatewayError;
use filters::{inline_params, QueryParams};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_PREFIX: &str = "ch";

pub type CacheCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call knobs for [`Gateway::query`].
#[derive(Clone)]
pub struct QueryOptions {
  pub use_cache: bool,
  pub ttl: Duration,
  pub params: QueryParams,
  pub cache_key_prefix: String,
  pub on_cache_hit: Option<CacheCallback>,
  pub on_cache_miss: Option<CacheCallback>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      use_cache: true,
      ttl: DEFAULT_TTL,
      params: QueryParams::new(),
      cache_key_prefix: DEFAULT_CACHE_PREFIX.to_string(),
      on_cache_hit: None,
      on_cache_miss: None,
    }
  }
}

impl fmt::Debug for QueryOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("use_cache", &self.use_cache)
      .field("ttl", &self.ttl)
      .field("params", &self.params)
      .field("cache_key_prefix", &self.cache_key_prefix)
      .finish()
  }
}

impl QueryOptions {
  pub fn with_params(mut self, params: QueryParams) -> Self {
    self.params = params;
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_cache(mut self, use_cache: bool) -> Self {
    self.use_cache = use_cache;
    self
  }

  pub fn with_prefix(mut self, prefix: &str) -> Self {
    self.cache_key_prefix = prefix.to_string();
    self
  }

  pub fn on_hit(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
    self.on_cache_hit = Some(Arc::new(callback));
    self
  }

  pub fn on_miss(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
    self.on_cache_miss = Some(Arc::new(callback));
    self
  }
}

/// How the gateway reaches its backing services when it builds them itself.
#[derive(Debug, Clone)]
pub struct GatewayConnections {
  pub clickhouse: ClickHouseSettings,
  /// `None` runs without a cache.
  pub redis: Option<RedisSettings>,
}

enum Backends {
  Configured(GatewayConnections),
  #[cfg(test)]
  Injected,
}

/// Process-wide handle on the database and cache clients.
///
/// Clients are created on first use and torn down by [`Gateway::close`],
/// after which every query fails with [`GatewayError::NotInitialized`].
pub struct Gateway {
  backends: Backends,
  db: OnceCell<Arc<dyn QueryClient>>,
  cache: OnceCell<Option<Arc<dyn CacheStore>>>,
  closed: AtomicBool,
}

impl Gateway {
  pub fn new(connections: GatewayConnections) -> Self {
    Self {
      backends: Backends::Configured(connections),
      db: OnceCell::new(),
      cache: OnceCell::new(),
      closed: AtomicBool::new(false),
    }
  }

  /// Builds a gateway around already constructed clients.
  #[cfg(test)]
  pub fn with_clients(db: Arc<dyn QueryClient>, cache: Option<Arc<dyn CacheStore>>) -> Self {
    Self {
      backends: Backends::Injected,
      db: OnceCell::new_with(Some(db)),
      cache: OnceCell::new_with(Some(cache)),
      closed: AtomicBool::new(false),
    }
  }

  async fn db(&self) -> Result<Arc<dyn QueryClient>, GatewayError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(GatewayError::NotInitialized);
    }
    let client = self.db.get_or_try_init(|| async {
      match &self.backends {
        Backends::Configured(conns) => {
          let client: Arc<dyn QueryClient> = Arc::new(ClickHouseClient::new(conns.clickhouse.clone())?);
          Ok::<_, GatewayError>(client)
        },
        #[cfg(test)]
        Backends::Injected => Err(GatewayError::NotInitialized),
      }
    }).await?;
    Ok(client.clone())
  }

  async fn cache(&self) -> Option<Arc<dyn CacheStore>> {
    if self.closed.load(Ordering::Acquire) {
      return None;
    }
    let cache = self.cache.get_or_init(|| async {
      match &self.backends {
        Backends::Configured(GatewayConnections { redis: Some(settings), .. }) => match RedisCache::new(settings) {
          Ok(cache) => Some(Arc::new(cache) as Arc<dyn CacheStore>),
          Err(e) => {
            warn!("redis cache unavailable, continuing without it: {}", e);
            None
          }
        },
        _ => None,
      }
    }).await;
    cache.clone()
  }

  /// Runs `sql` and returns its rows, serving and filling the cache when
  /// `options.use_cache` is set.
  ///
  /// Cache failures never fail the call: a broken read falls back to the
  /// database and a broken write is only logged.
  pub async fn query(&self, sql: &str, options: &QueryOptions) -> Result<Vec<Row>, GatewayError> {
    let db = self.db().await?;

    let cached = if options.use_cache {
      match self.cache().await {
        Some(cache) => Some((cache, cache_key(&options.cache_key_prefix, sql, &options.params))),
        None => None,
      }
    } else {
      None
    };

    if let Some((cache, key)) = &cached {
      match cache.get(key).await {
        Ok(Some(payload)) => match decode_cached(&payload) {
          Ok(rows) => {
            debug!(key = %key, rows = rows.len(), "cache hit");
            if let Some(on_hit) = &options.on_cache_hit {
              on_hit(key);
            }
            return Ok(rows);
          },
          Err(e) => warn!(key = %key, "discarding undecodable cache entry: {}", e),
        },
        Ok(None) => {},
        Err(e) => warn!(key = %key, "cache read failed, querying database: {}", e),
      }
      if let Some(on_miss) = &options.on_cache_miss {
        on_miss(key);
      }
    }

    let rows = db.query_rows(sql, &options.params).await.map_err(|e| {
      error!(query = %inline_params(sql, &options.params), "query failed: {}", e);
      match e {
        GatewayError::NotInitialized => e,
        other => GatewayError::QueryExecution(other.to_string()),
      }
    })?;

    if let Some((cache, key)) = &cached {
      match serde_json::to_string(&rows) {
        Ok(payload) => {
          if let Err(e) = cache.set(key, &payload, options.ttl).await {
            warn!(key = %key, "cache write failed: {}", e);
          }
        },
        Err(e) => warn!("failed to serialize rows for cache: {}", e),
      }
    }

    Ok(rows)
  }

  /// Removes cached results matching a glob pattern.
  pub async fn clear_cache(&self, pattern: &str) -> Result<usize, GatewayError> {
    match self.cache().await {
      Some(cache) => cache.clear_pattern(pattern).await,
      None => Ok(0),
    }
  }

  /// A database handle for one streaming consumer; the caller closes it.
  pub async fn dedicated_client(&self) -> Result<Arc<dyn QueryClient>, GatewayError> {
    Ok(self.db().await?.dedicated())
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Closes both clients. Safe to call more than once.
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(db) = self.db.get() {
      db.close().await;
    }
    if let Some(Some(cache)) = self.cache.get() {
      cache.close().await;
    }
    info!("gateway closed");
  }
}

fn decode_cached(payload: &str) -> Result<Vec<Row>, GatewayError> {
  let value = serde_json::from_str(payload).map_err(|e| GatewayError::Decode(e.to_string()))?;
  rows_from_value(value)
}
