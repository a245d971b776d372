use std::{sync::{atomic::{AtomicBool, Ordering}, Arc}, time::Duration};
use axum::{
  body::Bytes,
  extract::{rejection::{PathRejection, QueryRejection}, Path, Query, State},
  http::HeaderMap, response::{IntoResponse, Response}, Json
};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::json;

use crate::{
  config::TableSpec,
  gateway::{
    dates::convert_to_exact_date,
    filters::{build_where_condition, validate_identifier, validate_order_by, AsOfDate, BoundSql, FilterCondition},
    QueryOptions,
  },
  midwares::app_state::{decode_json_body, AppError, AppState},
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
  #[serde(default)]
  pub filters: Vec<FilterCondition>,
  pub order_by: Option<String>,
  #[serde(default)]
  pub remove_as_of_date: bool,
  pub limit: Option<u64>,
  pub offset: Option<u64>,
  pub use_cache: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
  #[serde(default)]
  pub filters: Vec<FilterCondition>,
  #[serde(default)]
  pub group_by: Vec<String>,
  #[serde(default)]
  pub measures: Vec<String>,
  pub order_by: Option<String>,
  #[serde(default)]
  pub remove_as_of_date: bool,
  pub use_cache: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DateResolveParams {
  pub offset: String,
  pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CacheClearParams {
  pub pattern: Option<String>,
}

fn content_encoding(headers: &HeaderMap) -> Option<&str> {
  headers.get("content-encoding").and_then(|v| v.to_str().ok())
}

fn check_columns<'a>(spec: &TableSpec, columns: impl IntoIterator<Item = &'a str>) -> Result<(), AppError> {
  for column in columns {
    validate_identifier(column).map_err(|e| AppError::BadRequest(e.to_string()))?;
    if !spec.allows_column(column) {
      return Err(AppError::BadRequest(format!("Unknown column {} for table {}", column, spec.name)));
    }
  }
  Ok(())
}

fn order_by_columns(order_by: &str) -> Vec<&str> {
  order_by
    .split(',')
    .filter_map(|term| term.split_whitespace().next())
    .collect()
}

fn base_options(state: &AppState, use_cache: Option<bool>) -> QueryOptions {
  QueryOptions::default()
    .with_ttl(Duration::from_secs(state.settings.ttl_secs))
    .with_prefix(&state.settings.cache_key_prefix)
    .with_cache(use_cache.unwrap_or(true))
}

/// Runs bound SQL through the gateway and reports cache use in `x-cache`.
async fn cached_rows(state: &AppState, bound: BoundSql, options: QueryOptions, context: String) -> Result<Response, AppError> {
  let hit = Arc::new(AtomicBool::new(false));
  let miss = Arc::new(AtomicBool::new(false));
  let (hit_flag, miss_flag) = (hit.clone(), miss.clone());
  let options = options
    .with_params(bound.params)
    .on_hit(move |_| hit_flag.store(true, Ordering::Relaxed))
    .on_miss(move |_| miss_flag.store(true, Ordering::Relaxed));

  let rows = state.gateway
    .query(&bound.sql, &options)
    .await
    .map_err(|e| AppError::from_gateway(context, e))?;

  // neither callback fires when the cache is disabled or unreachable
  let cache_status = match (hit.load(Ordering::Relaxed), miss.load(Ordering::Relaxed)) {
    (true, _) => "HIT",
    (false, true) => "MISS",
    (false, false) => "BYPASS",
  };
  Ok(([("x-cache", cache_status)], Json(rows)).into_response())
}

fn join_sql(parts: &[&str]) -> String {
  parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join(" ")
}

pub async fn data_handler(
  State(state): State<AppState>,
  path: Result<Path<String>, PathRejection>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Response, AppError> {
  let Path(table) = path?;
  let request: DataRequest = decode_json_body(&body, content_encoding(&headers))?;
  let spec = state.table(&table)?;

  check_columns(spec, request.filters.iter().map(|f| f.column.as_str()))?;
  if let Some(order_by) = &request.order_by {
    check_columns(spec, order_by_columns(order_by))?;
  }

  let as_of = spec.date_column.as_deref().map(AsOfDate::today);
  let mut bound = build_where_condition(&request.filters, request.remove_as_of_date, request.order_by.as_deref(), as_of.as_ref())
    .map_err(|e| AppError::from_gateway(format!("Failed to build query for {}", table), e))?;

  let max_rows = state.settings.max_rows;
  let limit = bound.bind_named("limit", request.limit.unwrap_or(max_rows).min(max_rows), "UInt64");
  let offset = bound.bind_named("offset", request.offset.unwrap_or(0), "UInt64");
  let from = format!("SELECT * FROM {}", spec.name);
  let paging = format!("LIMIT {} OFFSET {}", limit, offset);
  bound.sql = join_sql(&[&from, &bound.sql, &paging]);

  let options = base_options(&state, request.use_cache);
  cached_rows(&state, bound, options, format!("Failed to load data for {}", table)).await
}

/// Grouped sums of the requested measures, for dashboard cards and charts.
pub async fn summary_handler(
  State(state): State<AppState>,
  path: Result<Path<String>, PathRejection>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Response, AppError> {
  let Path(table) = path?;
  let request: SummaryRequest = decode_json_body(&body, content_encoding(&headers))?;
  let spec = state.table(&table)?;

  if request.measures.is_empty() {
    return Err(AppError::BadRequest("At least one measure is required".to_string()));
  }
  check_columns(spec, request.filters.iter().map(|f| f.column.as_str()))?;
  check_columns(spec, request.group_by.iter().map(String::as_str))?;
  check_columns(spec, request.measures.iter().map(String::as_str))?;

  let order_by = match request.order_by.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
    Some(order_by) => {
      let normalised = validate_order_by(order_by).map_err(|e| AppError::BadRequest(e.to_string()))?;
      check_columns(spec, order_by_columns(&normalised))?;
      format!("ORDER BY {}", normalised)
    },
    None => String::new(),
  };

  let as_of = spec.date_column.as_deref().map(AsOfDate::today);
  let mut bound = build_where_condition(&request.filters, request.remove_as_of_date, None, as_of.as_ref())
    .map_err(|e| AppError::from_gateway(format!("Failed to build summary for {}", table), e))?;

  let selected: Vec<String> = request.group_by.iter().cloned()
    .chain(request.measures.iter().map(|m| format!("sum({m}) AS {m}")))
    .collect();
  let select = format!("SELECT {} FROM {}", selected.join(", "), spec.name);
  let group_by = if request.group_by.is_empty() {
    String::new()
  } else {
    format!("GROUP BY {}", request.group_by.join(", "))
  };
  bound.sql = join_sql(&[&select, &bound.sql, &group_by, &order_by]);

  let options = base_options(&state, request.use_cache);
  let context = format!("Failed to load {} summary for {}", request.measures.join(", "), table);
  cached_rows(&state, bound, options, context).await
}

/// Distinct values of one column, used to populate filter widgets.
pub async fn filter_options_handler(
  State(state): State<AppState>,
  path: Result<Path<(String, String)>, PathRejection>,
) -> Result<Response, AppError> {
  let Path((table, column)) = path?;
  let spec = state.table(&table)?;
  check_columns(spec, [column.as_str()])?;

  let bound = BoundSql {
    sql: format!("SELECT DISTINCT {} AS value FROM {} ORDER BY value", column, spec.name),
    params: Default::default(),
  };
  let options = base_options(&state, None)
    .with_ttl(Duration::from_secs(state.settings.filter_ttl_secs))
    .with_prefix(&format!("{}:filters", state.settings.cache_key_prefix));
  cached_rows(&state, bound, options, format!("Failed to load {} values for {}", column, table)).await
}

pub async fn resolve_date_handler(
  query: Result<Query<DateResolveParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
  let Query(params) = query?;
  let reference = match params.reference.as_deref() {
    Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
      .map_err(|_| AppError::BadRequest(format!("Invalid reference date: {}", raw)))?,
    None => Local::now().date_naive(),
  };
  let date = convert_to_exact_date(&params.offset, reference)?;
  Ok(Json(json!({ "date": date })))
}

pub async fn clear_cache_handler(
  State(state): State<AppState>,
  query: Result<Query<CacheClearParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
  let Query(params) = query?;
  let pattern = params
    .pattern
    .unwrap_or_else(|| format!("{}:*", state.settings.cache_key_prefix));
  let cleared = state.gateway
    .clear_cache(&pattern)
    .await
    .map_err(|e| AppError::from_gateway(format!("Failed to clear cache for {}", pattern), e))?;
  Ok(Json(json!({ "pattern": pattern, "cleared": cleared })))
}

pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
  let status = if state.gateway.is_closed() { "closing" } else { "ok" };
  Json(json!({ "status": status, "tables": state.catalog.len() }))
}
