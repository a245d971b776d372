use std::{collections::HashMap, path::{Path, PathBuf}, time::Duration};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
  gateway::{cache::RedisSettings, clickhouse::ClickHouseSettings, filters::validate_identifier, GatewayConnections, DEFAULT_CACHE_PREFIX},
  relay::{RelaySettings, DEFAULT_PAGE_SIZE},
};

// =============================================================================
// CLI / environment
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "frontview", version, about = "GDM Frontview data backend")]
pub struct Args {
  /// Server bind address
  #[arg(long, env = "FRONTVIEW_BIND", default_value = "0.0.0.0:7575")]
  pub bind: String,

  /// Path to the TOML config file
  #[arg(long, env = "FRONTVIEW_CONFIG", default_value = "frontview.toml")]
  pub config: PathBuf,

  /// ClickHouse HTTP endpoint
  #[arg(long, env = "CLICKHOUSE_URL", default_value = "http://localhost:8123")]
  pub clickhouse_url: String,

  #[arg(long, env = "CLICKHOUSE_USER", default_value = "default")]
  pub clickhouse_user: String,

  #[arg(long, env = "CLICKHOUSE_PASSWORD", hide_env_values = true)]
  pub clickhouse_password: Option<String>,

  #[arg(long, env = "CLICKHOUSE_DATABASE")]
  pub clickhouse_database: Option<String>,

  #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
  pub redis_host: String,

  #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
  pub redis_port: u16,

  #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
  pub redis_password: Option<String>,

  #[arg(long, env = "REDIS_DB", default_value_t = 0)]
  pub redis_db: i64,

  /// Run without the Redis result cache
  #[arg(long, env = "CACHE_DISABLED", default_value_t = false)]
  pub cache_disabled: bool,

  /// Origin allowed by CORS (any origin when unset)
  #[arg(long, env = "ALLOWED_ORIGIN")]
  pub allowed_origin: Option<String>,
}

impl Args {
  pub fn connections(&self, file: &FileConfig) -> GatewayConnections {
    let redis = (!self.cache_disabled).then(|| RedisSettings {
      host: self.redis_host.clone(),
      port: self.redis_port,
      password: self.redis_password.clone(),
      db: self.redis_db,
    });
    GatewayConnections {
      clickhouse: ClickHouseSettings {
        url: self.clickhouse_url.clone(),
        user: self.clickhouse_user.clone(),
        password: self.clickhouse_password.clone(),
        database: self.clickhouse_database.clone(),
        request_timeout: Duration::from_secs(file.gateway.request_timeout_secs),
      },
      redis,
    }
  }
}

// =============================================================================
// Config file
// =============================================================================

#[derive(Debug, Deserialize, Default, Clone)]
pub struct FileConfig {
  #[serde(default)]
  pub gateway: GatewayConfig,
  #[serde(default)]
  pub stream: StreamConfig,
  #[serde(default)]
  pub tables: Vec<TableSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  #[serde(default = "default_filter_ttl_secs")]
  pub filter_ttl_secs: u64,
  #[serde(default = "default_cache_prefix")]
  pub cache_key_prefix: String,
  #[serde(default = "default_max_rows")]
  pub max_rows: u64,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      filter_ttl_secs: default_filter_ttl_secs(),
      cache_key_prefix: default_cache_prefix(),
      max_rows: default_max_rows(),
      request_timeout_secs: default_request_timeout(),
    }
  }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  #[serde(default = "default_page_size")]
  pub page_size: u64,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self { poll_interval_ms: default_poll_interval_ms(), page_size: default_page_size() }
  }
}

impl StreamConfig {
  pub fn relay_settings(&self) -> RelaySettings {
    RelaySettings {
      page_size: self.page_size.max(1),
      poll_interval: Duration::from_millis(self.poll_interval_ms),
    }
  }
}

fn default_ttl_secs() -> u64 {
  300
}
fn default_filter_ttl_secs() -> u64 {
  3600
}
fn default_cache_prefix() -> String {
  DEFAULT_CACHE_PREFIX.to_string()
}
fn default_max_rows() -> u64 {
  10_000
}
fn default_request_timeout() -> u64 {
  30
}
fn default_poll_interval_ms() -> u64 {
  5_000
}
fn default_page_size() -> u64 {
  DEFAULT_PAGE_SIZE
}

/// A table the API may query. Columns double as the allow-list for filters,
/// grouping, measures and ordering; an empty list allows any valid identifier.
#[derive(Debug, Deserialize, Clone)]
pub struct TableSpec {
  pub name: String,
  #[serde(default)]
  pub columns: Vec<String>,
  /// Column used for the implicit latest-date predicate.
  pub date_column: Option<String>,
  /// Monotonic id column; tables without one cannot be streamed.
  pub id_column: Option<String>,
}

impl TableSpec {
  pub fn allows_column(&self, column: &str) -> bool {
    self.columns.is_empty() || self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
  }
}

#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
  tables: HashMap<String, TableSpec>,
}

impl TableCatalog {
  pub fn new(specs: Vec<TableSpec>) -> Result<Self, String> {
    let mut tables = HashMap::new();
    for spec in specs {
      let names = std::iter::once(&spec.name)
        .chain(spec.columns.iter())
        .chain(spec.date_column.iter())
        .chain(spec.id_column.iter());
      for name in names {
        validate_identifier(name).map_err(|e| format!("table {}: {}", spec.name, e))?;
      }
      tables.insert(spec.name.clone(), spec);
    }
    Ok(Self { tables })
  }

  pub fn get(&self, name: &str) -> Option<&TableSpec> {
    self.tables.get(name)
  }

  pub fn len(&self) -> usize {
    self.tables.len()
  }
}

/// Reads the config file; a missing file yields defaults and an empty catalog.
pub fn load_file_config(path: &Path) -> Result<FileConfig, String> {
  if !path.exists() {
    warn!(path = %path.display(), "config file not found, using defaults (no tables exposed)");
    return Ok(FileConfig::default());
  }
  let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
  let config: FileConfig = toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
  info!(path = %path.display(), tables = config.tables.len(), "loaded config");
  Ok(config)
}
