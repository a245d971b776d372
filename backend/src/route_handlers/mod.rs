pub mod queries;
pub mod stream;

use axum::{
  http::{header, HeaderValue, Method}, middleware, routing::{delete, get, post}, Router
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::midwares::app_state::{request_tracker, AppState};

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/health", get(queries::health_handler))
    .route("/api/data/{table}", post(queries::data_handler))
    .route("/api/summary/{table}", post(queries::summary_handler))
    .route("/api/filters/{table}/{column}", get(queries::filter_options_handler))
    .route("/api/dates/resolve", get(queries::resolve_date_handler))
    .route("/api/cache", delete(queries::clear_cache_handler))
    .route("/api/stream/{table}", get(stream::stream_handler))
    .layer(middleware::from_fn(request_tracker))
    .with_state(state)
}

pub fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
  let origin = match allowed_origin.map(HeaderValue::from_str) {
    Some(Ok(origin)) => AllowOrigin::exact(origin),
    Some(Err(e)) => {
      warn!("ignoring invalid ALLOWED_ORIGIN: {}", e);
      AllowOrigin::from(Any)
    },
    None => AllowOrigin::from(Any),
  };
  CorsLayer::new()
    .allow_origin(origin)
    .allow_methods([Method::GET, Method::POST, Method::DELETE])
    .allow_headers([header::CONTENT_TYPE, header::CONTENT_ENCODING])
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use axum::{body::{to_bytes, Body}, http::{Request, StatusCode}, response::Response};
  use chrono::Local;
  use serde_json::{json, Value};
  use tokio::sync::watch;
  use tower::ServiceExt;

  use super::*;
  use crate::{
    config::{GatewayConfig, TableCatalog, TableSpec},
    gateway::{filters::inline_params, mock::{row, MockCache, MockClient}, Gateway},
    relay::RelaySettings,
  };

  fn catalog() -> TableCatalog {
    TableCatalog::new(vec![
      TableSpec {
        name: "risk_summary".into(),
        columns: ["desk", "book", "asOfDate", "exposure", "notional"].iter().map(|c| c.to_string()).collect(),
        date_column: Some("asOfDate".into()),
        id_column: None,
      },
      TableSpec {
        name: "financing_trades".into(),
        columns: vec![],
        date_column: None,
        id_column: Some("id".into()),
      },
    ])
    .unwrap()
  }

  fn app(db: &MockClient, cache: &Arc<MockCache>) -> Router {
    // sender dropped: shutdown never fires
    let (_, shutdown) = watch::channel(false);
    app_with_shutdown(db, cache, shutdown)
  }

  fn app_with_shutdown(db: &MockClient, cache: &Arc<MockCache>, shutdown: watch::Receiver<bool>) -> Router {
    let state = AppState {
      gateway: Arc::new(Gateway::with_clients(Arc::new(db.clone()), Some(cache.clone()))),
      catalog: Arc::new(catalog()),
      settings: Arc::new(GatewayConfig::default()),
      relay: RelaySettings { page_size: 1000, poll_interval: std::time::Duration::from_millis(1) },
      shutdown,
    };
    router(state)
  }

  fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
      .method("POST")
      .uri(uri)
      .header("content-type", "application/json")
      .body(Body::from(body.to_string()))
      .unwrap()
  }

  fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
  }

  async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
  }

  #[tokio::test]
  async fn test_summary_injects_as_of_date() {
    let db = MockClient::repeating(vec![row(1, "Loans")]);
    let cache = Arc::new(MockCache::default());
    let body = json!({
      "filters": [{"type": "desk", "operator": "is", "value": ["Loans"]}],
      "groupBy": ["desk"],
      "measures": ["exposure"]
    });

    let response = app(&db, &cache).oneshot(post_json("/api/summary/risk_summary", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (sql, params) = db.queries().remove(0);
    let inlined = inline_params(&sql, &params);
    assert!(inlined.contains("desk IN ('Loans')"), "{inlined}");
    assert!(inlined.contains(&format!("asOfDate = '{}'", today())), "{inlined}");
    assert!(inlined.starts_with("SELECT desk, sum(exposure) AS exposure FROM risk_summary WHERE"));
    assert!(inlined.ends_with("GROUP BY desk"));
  }

  #[tokio::test]
  async fn test_summary_without_as_of_date() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());
    let body = json!({
      "filters": [{"type": "desk", "operator": "is", "value": ["Loans"]}],
      "measures": ["notional"],
      "removeAsOfDate": true,
      "orderBy": "notional desc"
    });

    let response = app(&db, &cache).oneshot(post_json("/api/summary/risk_summary", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (sql, params) = db.queries().remove(0);
    assert_eq!(
      inline_params(&sql, &params),
      "SELECT sum(notional) AS notional FROM risk_summary WHERE desk IN ('Loans') ORDER BY notional DESC"
    );
  }

  #[tokio::test]
  async fn test_data_is_cached_between_requests() {
    let db = MockClient::repeating(vec![row(1, "Loans"), row(2, "Repo")]);
    let cache = Arc::new(MockCache::default());
    let body = json!({"filters": [{"type": "book", "operator": "is not", "value": ["B1"]}], "limit": 50});

    let first = app(&db, &cache).oneshot(post_json("/api/data/risk_summary", body.clone())).await.unwrap();
    assert_eq!(first.headers()["x-cache"], "MISS");
    let second = app(&db, &cache).oneshot(post_json("/api/data/risk_summary", body)).await.unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");

    assert_eq!(db.calls(), 1);
    assert_eq!(body_json(second).await, json!([{"id": 1, "desk": "Loans"}, {"id": 2, "desk": "Repo"}]));

    let (sql, params) = db.queries().remove(0);
    assert!(sql.starts_with("SELECT * FROM risk_summary WHERE book NOT IN ({p0:String})"));
    assert_eq!(params.get("limit"), Some(&json!(50)));
    assert!(cache.keys()[0].starts_with("ch:"));
  }

  #[tokio::test]
  async fn test_unreadable_cache_reports_miss() {
    let db = MockClient::repeating(vec![row(1, "Loans")]);
    let cache = Arc::new(MockCache::failing_reads());

    let response = app(&db, &cache).oneshot(post_json("/api/data/financing_trades", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(db.calls(), 1);
  }

  #[tokio::test]
  async fn test_data_limit_is_capped() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());
    let body = json!({"limit": 1_000_000, "useCache": false});

    let response = app(&db, &cache).oneshot(post_json("/api/data/financing_trades", body)).await.unwrap();
    assert_eq!(response.headers()["x-cache"], "BYPASS");
    let (sql, params) = db.queries().remove(0);
    assert_eq!(sql, "SELECT * FROM financing_trades LIMIT {limit:UInt64} OFFSET {offset:UInt64}");
    assert_eq!(params.get("limit"), Some(&json!(10_000)));
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_unknown_table_and_column_are_rejected() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(post_json("/api/data/secrets", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Unknown table: secrets");

    let body = json!({"filters": [{"type": "salary", "operator": "is", "value": ["1"]}]});
    let response = app(&db, &cache).oneshot(post_json("/api/data/risk_summary", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&db, &cache).oneshot(post_json("/api/data/risk_summary", json!({"orderBy": "desk; DROP"}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(db.calls(), 0);
  }

  #[tokio::test]
  async fn test_malformed_body_is_400() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());
    let request = Request::builder()
      .method("POST")
      .uri("/api/data/risk_summary")
      .body(Body::from("{\"filters\": 3"))
      .unwrap();

    let response = app(&db, &cache).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].as_str().unwrap().starts_with("Invalid request body"));
  }

  #[tokio::test]
  async fn test_query_failure_envelope() {
    let db = MockClient::failing("Code: 81. Database gdm does not exist");
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(get("/api/filters/risk_summary/desk")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Failed to load desk values for risk_summary");
    assert!(body["details"].as_str().unwrap().contains("does not exist"));
  }

  #[tokio::test]
  async fn test_filter_options_use_long_ttl() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(get("/api/filters/risk_summary/book")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let key = cache.keys().remove(0);
    assert!(key.starts_with("ch:filters:"));
    assert_eq!(cache.ttl_of(&key), Some(std::time::Duration::from_secs(3600)));
    assert_eq!(db.queries()[0].0, "SELECT DISTINCT book AS value FROM risk_summary ORDER BY value");
  }

  #[tokio::test]
  async fn test_resolve_date() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(get("/api/dates/resolve?offset=-1m&reference=2024-03-15")).await.unwrap();
    assert_eq!(body_json(response).await, json!({"date": "2024-02-15"}));

    let response = app(&db, &cache).oneshot(get("/api/dates/resolve?offset=bogus")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn test_bad_query_strings_get_json_errors() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());

    for uri in ["/api/dates/resolve", "/api/stream/financing_trades?lastUpdate=abc"] {
      let response = app(&db, &cache).oneshot(get(uri)).await.unwrap();
      assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
      assert_eq!(response.headers()["content-type"], "application/json", "{uri}");
      let body = body_json(response).await;
      assert!(body["error"].as_str().unwrap().starts_with("Failed to deserialize query string"), "{uri}: {body}");
    }
    assert_eq!(db.calls(), 0);
    assert_eq!(db.closes(), 0);
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());
    cache.insert("ch:a", "[]");
    cache.insert("ch:filters:b", "[]");
    cache.insert("other:c", "[]");

    let request = Request::builder().method("DELETE").uri("/api/cache").body(Body::empty()).unwrap();
    let response = app(&db, &cache).oneshot(request).await.unwrap();
    assert_eq!(body_json(response).await, json!({"pattern": "ch:*", "cleared": 2}));
    assert_eq!(cache.keys(), vec!["other:c".to_string()]);
  }

  #[tokio::test]
  async fn test_stream_emits_rows_then_error() {
    let db = MockClient::paged(vec![Ok(vec![row(11, "Loans"), row(12, "Repo")]), Err("boom".into())]);
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(get("/api/stream/financing_trades?lastUpdate=10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("data: {\"desk\":\"Loans\",\"id\":11}\n\n"), "{text}");
    assert!(text.contains("data: {\"desk\":\"Repo\",\"id\":12}\n\n"), "{text}");
    assert!(text.contains("event: error\ndata: {\"error\":\"Database request failed: boom\"}\n\n"), "{text}");
    assert_eq!(text.matches("event: error").count(), 1);

    assert_eq!(db.calls(), 2);
    assert_eq!(db.queries()[0].1.get("watermark"), Some(&json!(10)));
    assert_eq!(db.queries()[1].1.get("watermark"), Some(&json!(12)));
    assert_eq!(db.closes(), 1);
  }

  #[tokio::test]
  async fn test_stream_ends_on_shutdown() {
    let db = MockClient::paged(vec![Ok(vec![row(1, "Loans")])]);
    let cache = Arc::new(MockCache::default());
    let (shutdown_tx, shutdown) = watch::channel(false);

    let response = app_with_shutdown(&db, &cache, shutdown)
      .oneshot(get("/api/stream/financing_trades"))
      .await
      .unwrap();
    tokio::spawn(async move {
      tokio::time::sleep(std::time::Duration::from_millis(50)).await;
      let _ = shutdown_tx.send(true);
    });

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(text.matches("data: ").count(), 1);
    assert!(!text.contains("event: error"));
    assert!(db.calls() > 1);
    assert_eq!(db.closes(), 1);
  }

  #[tokio::test]
  async fn test_stream_requires_id_column() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(get("/api/stream/risk_summary")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn test_health() {
    let db = MockClient::repeating(vec![]);
    let cache = Arc::new(MockCache::default());

    let response = app(&db, &cache).oneshot(get("/health")).await.unwrap();
    assert_eq!(body_json(response).await, json!({"status": "ok", "tables": 2}));
  }
}
