use std::{convert::Infallible, time::Duration};
use axum::{
  extract::{rejection::{PathRejection, QueryRejection}, Path, Query, State},
  response::sse::{Event, KeepAlive, Sse},
  Extension,
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
  midwares::app_state::{shutdown_requested, AppError, AppState, RequestContext},
  relay::{Relay, RelayFrame},
};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
  pub last_update: Option<u64>,
}

/// Streams rows newer than `lastUpdate` as server-sent events until the
/// client goes away or a poll fails.
pub async fn stream_handler(
  State(state): State<AppState>,
  path: Result<Path<String>, PathRejection>,
  query: Result<Query<StreamParams>, QueryRejection>,
  Extension(ctx): Extension<RequestContext>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
  let Path(table) = path?;
  let Query(params) = query?;
  let spec = state.table(&table)?;
  let id_column = spec.id_column.clone()
    .ok_or_else(|| AppError::BadRequest(format!("Table {} does not support streaming", table)))?;

  let client = state.gateway
    .dedicated_client()
    .await
    .map_err(|e| AppError::from_gateway(format!("Failed to open stream for {}", table), e))?;
  let mut relay = Relay::new(client, &spec.name, &id_column, params.last_update, state.relay)
    .map_err(|e| AppError::from_gateway(format!("Failed to open stream for {}", table), e))?;

  info!(remote_ip = %ctx.remote_ip, table = %table, last_update = ?params.last_update, "stream opened");

  let mut shutdown = Box::pin(shutdown_requested(state.shutdown.clone()));

  // the relay lives inside the stream, so a client disconnect drops it and closes its client
  let stream = async_stream::stream! {
    loop {
      let frame = tokio::select! {
        frame = relay.next_frame() => frame,
        _ = &mut shutdown => None,
      };
      match frame {
        Some(frame) => yield Ok(to_event(frame)),
        None => break,
      }
    }
    info!(table = %table, watermark = relay.watermark(), "stream ended");
    relay.close().await;
  };

  Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("keep-alive")))
}

fn to_event(frame: RelayFrame) -> Event {
  match frame {
    RelayFrame::Row(row) => Event::default().data(serde_json::Value::Object(row).to_string()),
    RelayFrame::Error(message) => Event::default().event("error").data(json!({ "error": message }).to_string()),
  }
}
