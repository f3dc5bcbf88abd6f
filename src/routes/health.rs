//! Health, readiness, and version endpoints
//!
//! - /health, /healthz - liveness: 200 whenever the service runs
//! - /ready, /readyz   - readiness: 200 once the store is durable
//!   (or always in dev mode, where memory-only operation is intended)
//! - /version          - build info for deployment verification

use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::{json_response, BoxBody};
use crate::server::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    subscribers: usize,
    cache: CacheHealth,
    version: &'static str,
    uptime_secs: u64,
    node_id: String,
    timestamp: String,
}

#[derive(Serialize)]
struct CacheHealth {
    status: &'static str,
    #[serde(rename = "hitRate")]
    hit_rate: f64,
    #[serde(rename = "memoryUsage")]
    memory_usage: u64,
}

async fn build_health(state: &AppState) -> HealthResponse {
    let stats = state.cache.stats();

    let cache_status = match state.cache.l2_healthy().await {
        Some(true) => "connected",
        Some(false) => "degraded",
        None => "local-only",
    };

    HealthResponse {
        status: "ok",
        subscribers: state.broadcaster.subscriber_count(),
        cache: CacheHealth {
            status: cache_status,
            hit_rate: stats.l1_hit_rate,
            memory_usage: stats.l1.memory_bytes,
        },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        node_id: state.args.node_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Liveness probe: 200 whenever the process is serving
pub async fn health_check(state: Arc<AppState>) -> Response<BoxBody> {
    let response = build_health(&state).await;
    json_response(StatusCode::OK, &response)
}

/// Readiness probe: requires a durable store outside dev mode
pub async fn readiness_check(state: Arc<AppState>) -> Response<BoxBody> {
    let response = build_health(&state).await;
    let ready = state.store.is_durable() || state.args.dev_mode;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &response)
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    service: &'static str,
}

/// Version info for deployment verification
pub fn version_info() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &VersionResponse {
            version: env!("CARGO_PKG_VERSION"),
            service: "podium",
        },
    )
}
