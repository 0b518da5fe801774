//! HTTP server implementation for SaleStream
//!
//! This module sets up the Axum web server with all routes, middleware,
//! and graceful shutdown handling.

use axum::{
    extract::{MatchedPath, State},
    http::{header, HeaderName, Method, Request},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
    LatencyUnit,
};
use uuid::Uuid;

use crate::{
    api::{
        analytics::get_analytics,
        health::{build_info, health_check, ready_check, HealthState},
        sales::ingest_sale,
    },
    error::{Error, Result},
    pipeline::{Pipeline, PipelineStats},
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub health: HealthState,
}

/// Request ID generator
#[derive(Clone, Default)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(id.parse().ok()?))
    }
}

/// Create the main application router
pub fn create_router(pipeline: Arc<Pipeline>) -> Router {
    let config = pipeline.config().clone();
    let state = AppState {
        pipeline,
        health: HealthState::new(),
    };

    let mut routes = Router::new()
        .route("/sales", post(ingest_sale))
        .route("/analytics/:kind", get(get_analytics))
        .route("/admin/ingest/resume", post(resume_ingestion))
        .route("/healthz", get(health_check))
        .route("/readyz", get(ready_check))
        .route("/build", get(build_info));

    if config.features.metrics {
        routes = routes.route("/metrics", get(metrics_handler));
    }

    routes
        .with_state(state)
        .layer(TimeoutLayer::new(config.server.request_timeout()))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let matched_path =
                        request.extensions().get::<MatchedPath>().map(MatchedPath::as_str);
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");

                    tracing::info_span!(
                        "http_request",
                        method = ?request.method(),
                        matched_path,
                        request_id,
                        latency = tracing::field::Empty,
                        status = tracing::field::Empty,
                    )
                })
                .on_request(DefaultOnRequest::new().level(tracing::Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(tracing::Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
}

/// `POST /admin/ingest/resume`
async fn resume_ingestion(State(state): State<AppState>) -> Json<Value> {
    let resumed = state.pipeline.resume_ingestion();
    if resumed {
        tracing::warn!("Ingestion resumed by operator");
    }
    Json(json!({
        "resumed": resumed,
        "paused": state.pipeline.log().is_paused(),
    }))
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, samples: &[(&str, u64)]) {
    out.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind));
    for (labels, value) in samples {
        if labels.is_empty() {
            out.push_str(&format!("{} {}\n", name, value));
        } else {
            out.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
        }
    }
}

/// Render pipeline counters in the Prometheus text format
pub fn render_metrics(stats: &PipelineStats) -> String {
    let mut out = String::new();
    push_metric(
        &mut out,
        "salestream_buffer_records",
        "gauge",
        "Records held by the ingest buffer",
        &[
            ("state=\"buffered\"", stats.buffer.buffered as u64),
            ("state=\"in_flight\"", stats.buffer.in_flight as u64),
        ],
    );
    push_metric(
        &mut out,
        "salestream_events_accepted_total",
        "counter",
        "Events assigned a sequence id",
        &[("", stats.buffer.next_sequence.saturating_sub(1))],
    );
    push_metric(
        &mut out,
        "salestream_segments_committed_total",
        "counter",
        "Segments committed to the durable log by this process",
        &[("", stats.log.committed_segments)],
    );
    push_metric(
        &mut out,
        "salestream_commit_failures_total",
        "counter",
        "Commits that exhausted their retries",
        &[("", stats.log.commit_failures)],
    );
    push_metric(
        &mut out,
        "salestream_ingestion_paused",
        "gauge",
        "1 while the log refuses commits",
        &[("", u64::from(stats.log.paused))],
    );
    push_metric(
        &mut out,
        "salestream_cache_entries",
        "gauge",
        "Cached aggregate results",
        &[("", stats.cache.entries as u64)],
    );
    push_metric(
        &mut out,
        "salestream_cache_lookups_total",
        "counter",
        "Cache lookups by outcome",
        &[
            ("result=\"hit\"", stats.cache.hits),
            ("result=\"miss\"", stats.cache.misses),
        ],
    );
    push_metric(
        &mut out,
        "salestream_cache_recomputations_total",
        "counter",
        "Aggregate recomputations against the store by outcome",
        &[
            ("result=\"started\"", stats.cache.recomputations),
            ("result=\"failed\"", stats.cache.recompute_failures),
        ],
    );
    push_metric(
        &mut out,
        "salestream_cache_invalidations_total",
        "counter",
        "Entries expired by newly committed segments",
        &[("", stats.cache.invalidations)],
    );
    push_metric(
        &mut out,
        "salestream_query_timeouts_total",
        "counter",
        "Callers that gave up waiting on a recomputation",
        &[("", stats.cache.timeouts)],
    );
    push_metric(
        &mut out,
        "salestream_stale_responses_total",
        "counter",
        "Responses served from the grace fallback",
        &[("", stats.cache.stale_served)],
    );
    push_metric(
        &mut out,
        "salestream_recompute_permits_available",
        "gauge",
        "Free recomputation permits",
        &[("", stats.available_permits as u64)],
    );
    out
}

/// Metrics endpoint handler
async fn metrics_handler(State(state): State<AppState>) -> String {
    render_metrics(&state.pipeline.stats())
}

/// Start the flusher, serve HTTP until a shutdown signal, then flush
pub async fn create_server(pipeline: Arc<Pipeline>) -> Result<()> {
    let config = pipeline.config().clone();
    let addr: SocketAddr = config
        .server
        .address()
        .parse()
        .map_err(|e| Error::config(format!("Invalid server address: {}", e)))?;

    pipeline.start();
    let app = create_router(Arc::clone(&pipeline));

    tracing::info!(
        address = %addr,
        environment = %config.server.environment,
        "Starting HTTP server"
    );

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!(address = %addr, "HTTP server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::internal(format!("Server error: {}", e)));

    pipeline.shutdown().await?;
    served
}

/// Shutdown signal handler
///
/// Waits for CTRL+C or SIGTERM signals to gracefully shutdown the server.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
