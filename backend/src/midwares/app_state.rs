use std::{io::Read, net::SocketAddr, sync::Arc};
use axum::{
  extract::{rejection::{PathRejection, QueryRejection}, ConnectInfo, Request}, http::StatusCode, middleware::Next, response::{IntoResponse, Response}, Json
};
use flate2::read::DeflateDecoder;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{
  config::{GatewayConfig, TableCatalog, TableSpec},
  gateway::{error::{DateOffsetError, GatewayError}, Gateway},
  relay::RelaySettings,
};

// Request context containing caller information
#[derive(Clone, Debug)]
pub struct RequestContext {
  pub remote_ip: String,
}

#[derive(Debug, Serialize, Clone)]
pub enum AppError {
  DeserializeError(String),
  BadRequest(String),
  InternalError(String),
  QueryFailed { context: String, details: String },
}

impl AppError {
  /// Wraps a gateway failure with what the handler was doing at the time.
  pub fn from_gateway(context: impl Into<String>, err: GatewayError) -> Self {
    if err.is_validation() {
      return Self::BadRequest(err.to_string());
    }
    let context = context.into();
    error!("{}: {}", context, err);
    match err {
      GatewayError::NotInitialized => Self::InternalError(err.to_string()),
      other => Self::QueryFailed { context, details: other.to_string() },
    }
  }
}

impl From<DateOffsetError> for AppError {
  fn from(value: DateOffsetError) -> Self {
    AppError::BadRequest(value.to_string())
  }
}

impl From<QueryRejection> for AppError {
  fn from(value: QueryRejection) -> Self {
    AppError::BadRequest(value.body_text())
  }
}

impl From<PathRejection> for AppError {
  fn from(value: PathRejection) -> Self {
    AppError::BadRequest(value.body_text())
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let (status, body) = match self {
      Self::DeserializeError(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
      Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
      Self::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": msg})),
      Self::QueryFailed { context, details } => {
        (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": context, "details": details}))
      },
    };

    (status, Json(body)).into_response()
  }
}

/// Shared handles every route gets through axum state.
#[derive(Clone)]
pub struct AppState {
  pub gateway: Arc<Gateway>,
  pub catalog: Arc<TableCatalog>,
  pub settings: Arc<GatewayConfig>,
  pub relay: RelaySettings,
  /// Flips to true when the server starts draining; open streams end on it.
  pub shutdown: watch::Receiver<bool>,
}

impl AppState {
  pub fn table(&self, name: &str) -> Result<&TableSpec, AppError> {
    self.catalog.get(name).ok_or_else(|| AppError::BadRequest(format!("Unknown table: {}", name)))
  }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone
/// without signalling.
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
  if shutdown.wait_for(|stop| *stop).await.is_err() {
    std::future::pending::<()>().await;
  }
}

// Request tracking middleware
pub async fn request_tracker(mut req: Request, next: Next) -> Response {
  let socket_ip = req
    .extensions()
    .get::<ConnectInfo<SocketAddr>>()
    .map(|ConnectInfo(addr)| addr.ip().to_string());

  // behind the load balancer the caller is in X-Forwarded-For
  let remote_ip = req.headers()
    .get("x-forwarded-for")
    .and_then(|h| h.to_str().ok())
    .and_then(|v| v.split(',').next())
    .map(|v| v.trim().to_string())
    .or(socket_ip)
    .unwrap_or_else(|| "NA".to_string());

  info!(method = %req.method(), path = %req.uri().path(), remote_ip = %remote_ip, "request");
  req.extensions_mut().insert(RequestContext { remote_ip });

  next.run(req).await
}

pub fn decompress_if_needed(data: &[u8], content_encoding: Option<&str>) -> Result<Vec<u8>, AppError> {
  match content_encoding {
    Some("deflate") => {
      let mut decoder = DeflateDecoder::new(data);
      let mut decompressed_data = Vec::new();
      decoder.read_to_end(&mut decompressed_data).map_err(|e| AppError::BadRequest(e.to_string()))?;
      Ok(decompressed_data)
    },
    _ => Ok(data.to_vec())
  }
}

/// Decodes a (possibly deflated) JSON request body.
pub fn decode_json_body<T: DeserializeOwned>(body: &[u8], content_encoding: Option<&str>) -> Result<T, AppError> {
  let decompressed = decompress_if_needed(body, content_encoding)?;
  serde_json::from_slice(&decompressed).map_err(|e| AppError::DeserializeError(format!("Invalid request body: {}", e)))
}
