//! Health check endpoints for SaleStream
//!
//! Liveness is unconditional. Readiness checks the segment log, the
//! queryable store and buffer headroom on every call.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::{AppState, ComponentHealth, HealthResponse, HealthStatus, ReadyResponse, BUILD_INFO};
use crate::pipeline::Pipeline;

/// Last observed health of each component
#[derive(Clone, Default)]
pub struct HealthState {
    pub components: Arc<tokio::sync::RwLock<HashMap<String, ComponentHealth>>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update component health status
    pub async fn update_component(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        components.insert(
            name.to_string(),
            ComponentHealth {
                status,
                message,
                last_check: Utc::now(),
            },
        );
    }

    /// Worst status across all components
    pub async fn get_status(&self) -> HealthStatus {
        let components = self.components.read().await;

        if components.values().any(|c| c.status == HealthStatus::Unhealthy) {
            return HealthStatus::Unhealthy;
        }

        if components.values().any(|c| c.status == HealthStatus::Degraded) {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }

    /// Re-check every pipeline component
    pub async fn refresh(&self, pipeline: &Pipeline) {
        let stats = pipeline.stats();

        if stats.log.paused {
            self.update_component(
                "ingestion",
                HealthStatus::Unhealthy,
                Some("Ingestion paused after repeated commit failures".to_string()),
            )
            .await;
        } else {
            let pending = stats.buffer.buffered + stats.buffer.in_flight;
            let limit = pipeline.config().buffer.hard_limit();
            let (status, message) = if pending * 10 >= limit * 9 {
                (HealthStatus::Degraded, format!("Buffer near limit: {}/{}", pending, limit))
            } else {
                (HealthStatus::Healthy, format!("{} records pending", pending))
            };
            self.update_component("ingestion", status, Some(message)).await;
        }

        match pipeline.log().health_check().await {
            Ok(()) => {
                self.update_component("segment_log", HealthStatus::Healthy, None)
                    .await
            },
            Err(e) => {
                self.update_component("segment_log", HealthStatus::Unhealthy, Some(e.to_string()))
                    .await
            },
        }

        match pipeline.store().health_check().await {
            Ok(()) => {
                self.update_component("query_store", HealthStatus::Healthy, None)
                    .await
            },
            Err(e) => {
                self.update_component("query_store", HealthStatus::Unhealthy, Some(e.to_string()))
                    .await
            },
        }
    }
}

/// Basic liveness check endpoint
///
/// Returns 200 OK if the service is alive.
/// This endpoint should be lightweight and not check external dependencies.
pub async fn health_check() -> Response {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Service is running".to_string()),
        timestamp: Utc::now(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness check endpoint
///
/// Unhealthy while ingestion is paused or a store health check fails.
pub async fn ready_check(State(state): State<AppState>) -> Response {
    state.health.refresh(&state.pipeline).await;

    let components = state.health.components.read().await.clone();
    let overall_status = state.health.get_status().await;

    let response = ReadyResponse {
        status: overall_status,
        checks: components,
        timestamp: Utc::now(),
    };

    (overall_status.to_status_code(), Json(response)).into_response()
}

/// Build information endpoint
pub async fn build_info() -> Response {
    (StatusCode::OK, Json(&BUILD_INFO)).into_response()
}
