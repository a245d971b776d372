use thiserror::Error;

#[derive(Debug, Error)]
pub enum DateOffsetError {
  #[error("Invalid date offset format: {0} (expected e.g. -1m, 3d, 2w, 1y)")]
  InvalidFormat(String),
  #[error("Date offset {0} is out of range")]
  OutOfRange(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
  #[error("Database client not initialized")]
  NotInitialized,

  #[error("Invalid filter: {0}")]
  InvalidFilter(String),

  #[error("Invalid identifier: {0}")]
  InvalidIdentifier(String),

  #[error(transparent)]
  DateOffset(#[from] DateOffsetError),

  #[error("Database request failed: {0}")]
  Database(String),

  #[error("Failed to execute query: {0}")]
  QueryExecution(String),

  #[error("Failed to decode rows: {0}")]
  Decode(String),

  #[error("Cache error: {0}")]
  Cache(String),
}

impl GatewayError {
  /// Errors caused by the caller's input rather than by the backing services.
  pub fn is_validation(&self) -> bool {
    matches!(self, Self::InvalidFilter(_) | Self::InvalidIdentifier(_) | Self::DateOffset(_))
  }
}

impl From<redis::RedisError> for GatewayError {
  fn from(value: redis::RedisError) -> Self {
    GatewayError::Cache(value.to_string())
  }
}

impl From<reqwest::Error> for GatewayError {
  fn from(value: reqwest::Error) -> Self {
    GatewayError::Database(value.to_string())
  }
}
