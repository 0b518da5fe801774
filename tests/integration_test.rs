//! Integration tests for SaleStream
//!
//! These tests drive the HTTP router end to end over in-memory collaborators.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use salestream::{
    analytics::InMemorySalesStore,
    api::server::create_router,
    config::{
        BufferConfig, CacheConfig, Config, FeatureFlags, SegmentLogConfig, ServerConfig,
    },
    test_utils::{sample_sale_json, MemorySegmentStore, MockQueryableStore},
    Pipeline, QueryableStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Create a test configuration
fn create_test_config(max_records: usize) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_level: "debug".to_string(),
            environment: "test".to_string(),
            request_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        },
        buffer: BufferConfig {
            max_records,
            max_age_ms: 60_000,
            flush_check_interval_ms: 20,
        },
        log: SegmentLogConfig {
            segment_dir: "/unused".to_string(),
            commit_max_attempts: 3,
            commit_retry_base_ms: 1,
            commit_retry_max_ms: 2,
            replay_on_startup: true,
        },
        cache: CacheConfig::default(),
        features: FeatureFlags { metrics: true },
    }
}

async fn build_pipeline(
    config: Config,
    segments: &MemorySegmentStore,
    store: Arc<dyn QueryableStore>,
) -> Arc<Pipeline> {
    Arc::new(
        Pipeline::build(Arc::new(config), Arc::new(segments.clone()), store)
            .await
            .unwrap(),
    )
}

async fn default_app() -> Router {
    let pipeline = build_pipeline(
        create_test_config(100),
        &MemorySegmentStore::new(),
        Arc::new(InMemorySalesStore::new()),
    )
    .await;
    create_router(pipeline)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_for_commits(pipeline: &Pipeline, segments: u64) {
    for _ in 0..200 {
        if pipeline.stats().log.committed_segments >= segments {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} committed segments", segments);
}

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    let app = default_app().await;
    let (status, json) = send(&app, get("/healthz")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_build_info_endpoint() {
    let app = default_app().await;
    let (status, json) = send(&app, get("/build")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["version"].is_string());
    assert!(json["commit"].is_string());
}

#[tokio::test]
async fn test_ingest_accepts_valid_sale() {
    let app = default_app().await;
    let (status, json) = send(&app, post_json("/sales", &sample_sale_json())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Data ingested successfully");
    assert_eq!(json["sequenceId"], 1);
    assert!(json["recordId"].is_string());
}

#[tokio::test]
async fn test_ingest_without_timestamp_uses_ingest_time() {
    let app = default_app().await;
    let mut sale = sample_sale_json();
    sale.as_object_mut().unwrap().remove("timestamp");

    let (status, _) = send(&app, post_json("/sales", &sale)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_ingest_rejects_missing_price() {
    let app = default_app().await;
    let mut sale = sample_sale_json();
    sale.as_object_mut().unwrap().remove("price");

    let (status, json) = send(&app, post_json("/sales", &sale)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid");
    assert_eq!(json["error"]["status"], 400);
    assert!(json["error"]["message"].as_str().unwrap().contains("price"));

    // The rejected event consumed no sequence id
    let (_, json) = send(&app, post_json("/sales", &sample_sale_json())).await;
    assert_eq!(json["sequenceId"], 1);
}

#[tokio::test]
async fn test_ingest_rejects_bad_fields() {
    let app = default_app().await;
    for (field, value) in [
        ("price", json!(-3.5)),
        ("price", json!("cheap")),
        ("location", json!("ZZ")),
        ("product_id", json!("P 001")),
        ("timestamp", json!("last tuesday")),
    ] {
        let mut sale = sample_sale_json();
        sale[field] = value;
        let (status, json) = send(&app, post_json("/sales", &sale)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "field {}", field);
        assert_eq!(json["error"]["type"], "invalid");
    }
}

#[tokio::test]
async fn test_ingest_rejects_malformed_json() {
    let app = default_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/sales")
        .header("content-type", "application/json")
        .body(Body::from("{\"product_id\": "))
        .unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid");
}

#[tokio::test]
async fn test_ingest_signals_backpressure() {
    let pipeline = build_pipeline(
        create_test_config(2),
        &MemorySegmentStore::new(),
        Arc::new(InMemorySalesStore::new()),
    )
    .await;
    let app = create_router(pipeline);

    for _ in 0..4 {
        let (status, _) = send(&app, post_json("/sales", &sample_sale_json())).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, json) = send(&app, post_json("/sales", &sample_sale_json())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"]["type"], "backpressure");
}

#[tokio::test]
async fn test_analytics_rejects_unknown_kind() {
    let app = default_app().await;
    let (status, json) = send(&app, get("/analytics/daily-users")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "unknown_kind");
}

#[tokio::test]
async fn test_analytics_rejects_bad_window() {
    let app = default_app().await;

    let (status, json) = send(&app, get("/analytics/top-products?from=yesterday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid");

    let (status, _) = send(
        &app,
        get("/analytics/top-products?from=2024-03-02T00:00:00Z&to=2024-03-01T00:00:00Z"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ingested_sales_show_up_in_analytics() {
    let segments = MemorySegmentStore::new();
    let pipeline = build_pipeline(
        create_test_config(3),
        &segments,
        Arc::new(InMemorySalesStore::new()),
    )
    .await;
    pipeline.start();
    let app = create_router(Arc::clone(&pipeline));

    for (product, location, price) in [("P001", "CA", 10.25), ("P002", "NY", 5.50), ("P001", "TX", 0.25)] {
        let mut sale = sample_sale_json();
        sale["product_id"] = json!(product);
        sale["location"] = json!(location);
        sale["price"] = json!(price);
        let (status, _) = send(&app, post_json("/sales", &sale)).await;
        assert_eq!(status, StatusCode::OK);
    }
    wait_for_commits(&pipeline, 1).await;

    let (status, json) = send(&app, get("/analytics/top-products")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"][0]["product_id"], "P001");
    assert_eq!(json["data"][0]["sales_count"], 2);
    assert!(json.get("stale").is_none());

    let (_, json) = send(&app, get("/analytics/revenue-trends")).await;
    assert_eq!(json["data"][0]["date"], "2024-03-01");
    assert_eq!(json["data"][0]["total_revenue"], "16.00");

    let (_, json) = send(
        &app,
        get("/analytics/sales-by-location?from=2024-03-02T00:00:00Z"),
    )
    .await;
    assert!(json["data"].as_array().unwrap().is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upstream_failure_without_cache_is_bad_gateway() {
    let store = MockQueryableStore::new();
    let pipeline = build_pipeline(
        create_test_config(100),
        &MemorySegmentStore::new(),
        Arc::new(store.clone()),
    )
    .await;
    let app = create_router(pipeline);

    store.fail_next(1);
    let (status, json) = send(&app, get("/analytics/sales-by-category")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"]["type"], "upstream");

    let (status, json) = send(&app, get("/analytics/sales-by-category")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"][0]["kind"], "sales-by-category");
}

#[tokio::test]
async fn test_readiness_tracks_paused_ingestion() {
    let segments = MemorySegmentStore::new();
    let pipeline = build_pipeline(
        create_test_config(2),
        &segments,
        Arc::new(InMemorySalesStore::new()),
    )
    .await;
    pipeline.start();
    let app = create_router(Arc::clone(&pipeline));

    let (status, json) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");

    segments.fail_next_puts(3);
    for _ in 0..2 {
        send(&app, post_json("/sales", &sample_sale_json())).await;
    }
    for _ in 0..200 {
        if pipeline.log().is_paused() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, json) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["checks"]["ingestion"]["status"], "unhealthy");

    let (status, json) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/admin/ingest/resume")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["resumed"], true);

    wait_for_commits(&pipeline, 1).await;
    let (status, _) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(segments.segment_count(), 1);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint_reports_pipeline_counters() {
    let app = default_app().await;
    send(&app, post_json("/sales", &sample_sale_json())).await;

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("# TYPE salestream_buffer_records gauge"));
    assert!(text.contains("salestream_buffer_records{state=\"buffered\"} 1"));
    assert!(text.contains("salestream_events_accepted_total 1"));
    assert!(text.contains("salestream_ingestion_paused 0"));
}

#[tokio::test]
async fn test_request_id_header_is_set() {
    let app = default_app().await;
    let response = app.oneshot(get("/healthz")).await.unwrap();

    let request_id = response.headers().get("x-request-id").unwrap();
    assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
}
